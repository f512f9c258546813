//! Static-asset classification for forwarder routing
//!
//! Static assets are dialed directly, bypassing the upstream proxy; anything
//! that looks dynamic goes through it.

/// Path extensions treated as static assets
const STATIC_ASSET_EXTENSIONS: &[&str] = &[
    // JavaScript & CSS
    "js", "css", "mjs", "cjs",
    // Images
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif", "bmp", "tiff", "tif",
    // Fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // Video
    "mp4", "webm", "mkv", "avi", "mov", "wmv", "flv", "m4v",
    // Audio
    "mp3", "ogg", "wav", "flac", "m4a", "aac", "wma",
    // Documents
    "pdf",
    // Maps
    "map",
];

/// Common CDN/asset path markers
const ASSET_PATH_MARKERS: &[&str] = &[
    "/assets/", "/static/", "/images/", "/img/", "/fonts/", "/css/", "/js/", "/media/",
];

/// Whether a request targets a static asset
pub fn is_static_asset(path: &str, query: Option<&str>, accept: Option<&str>) -> bool {
    if let Some(ext) = path_extension(path) {
        if STATIC_ASSET_EXTENSIONS.contains(&ext.as_str()) {
            return true;
        }
    }

    if let Some(accept) = accept {
        if accept.contains("image/")
            || accept.contains("video/")
            || accept.contains("audio/")
            || accept.contains("font/")
            || accept.contains("application/font")
        {
            return true;
        }
    }

    let lower_path = path.to_lowercase();
    if ASSET_PATH_MARKERS.iter().any(|m| lower_path.contains(m)) {
        // An API call or a JSONP callback masquerading under an asset path
        // still needs the upstream exit IP.
        if !lower_path.contains("/api/") && !query.unwrap_or("").contains("callback") {
            return true;
        }
    }

    false
}

fn path_extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_match() {
        assert!(is_static_asset("/app/style.css", None, None));
        assert!(is_static_asset("/bundle.min.JS", None, None));
        assert!(is_static_asset("/logo.PNG", None, None));
        assert!(is_static_asset("/docs/manual.pdf", None, None));
        assert!(!is_static_asset("/index.html", None, None));
        assert!(!is_static_asset("/search", None, None));
        assert!(!is_static_asset("/weird.", None, None));
    }

    #[test]
    fn test_accept_header_match() {
        assert!(is_static_asset("/fetch", None, Some("image/avif,image/webp")));
        assert!(is_static_asset("/fetch", None, Some("font/woff2")));
        assert!(is_static_asset("/fetch", None, Some("application/font-woff")));
        assert!(!is_static_asset(
            "/fetch",
            None,
            Some("text/html,application/xhtml+xml")
        ));
    }

    #[test]
    fn test_asset_path_markers() {
        assert!(is_static_asset("/static/logo", None, None));
        assert!(is_static_asset("/CDN/Assets/logo", None, None));
        assert!(is_static_asset("/media/clip", None, None));

        // API paths and JSONP callbacks are dynamic even under asset paths.
        assert!(!is_static_asset("/static/api/v1/user", None, None));
        assert!(!is_static_asset(
            "/assets/data",
            Some("callback=jsonp123"),
            None
        ));
        assert!(is_static_asset("/assets/data", Some("v=3"), None));
    }

    #[test]
    fn test_plain_dynamic_request() {
        assert!(!is_static_asset("/", None, None));
        assert!(!is_static_asset("/api/v1/session", Some("expand=all"), None));
    }
}

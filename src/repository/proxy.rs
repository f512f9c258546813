use crate::error::Result;
use crate::models::{ProxyEntry, ProxyErrorInfo, ProxySpec};
use sqlx::SqlitePool;
use tracing::info;

const ENTRY_COLUMNS: &str = "id, kind, credential, api_key, change_url, min_time, fingerprint, \
     running, used, is_unique, last_changed, last_error, created_at, updated_at";

/// Repository for proxy catalog operations
///
/// Every mutation is a single statement, so partial writes cannot happen;
/// callers that also keep a cache mirror the row after the statement lands.
#[derive(Clone)]
pub struct ProxyRepository {
    pool: SqlitePool,
}

impl ProxyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get an entry by ID
    pub async fn get_by_id(&self, id: i64) -> Result<Option<ProxyEntry>> {
        let entry = sqlx::query_as::<_, ProxyEntry>(&format!(
            "SELECT {} FROM proxies WHERE id = ?1",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Get all entries
    pub async fn get_all(&self) -> Result<Vec<ProxyEntry>> {
        let entries = sqlx::query_as::<_, ProxyEntry>(&format!(
            "SELECT {} FROM proxies ORDER BY id",
            ENTRY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Quarantined entries, newest failure first
    pub async fn list_errors(&self) -> Result<Vec<ProxyErrorInfo>> {
        let rows = sqlx::query_as::<_, ProxyErrorInfo>(
            r#"
            SELECT id, kind, credential, api_key, last_error AS error, updated_at
            FROM proxies
            WHERE last_error != ''
            ORDER BY updated_at DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Total entry count
    pub async fn count_total(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM proxies")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Insert-or-update on fingerprint
    ///
    /// On collision the descriptor fields (credential, min_time, change_url,
    /// uniqueness, last_changed) are refreshed and the counters are left
    /// untouched. Returns the id of the inserted or updated row.
    pub async fn upsert(
        &self,
        spec: &ProxySpec,
        credential: &str,
        last_changed: i64,
        now: i64,
    ) -> Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO proxies
                (kind, credential, api_key, change_url, min_time, fingerprint,
                 is_unique, running, used, last_error, last_changed, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, '', ?8, ?9, ?9)
            ON CONFLICT(fingerprint) DO UPDATE SET
                credential = excluded.credential,
                min_time = excluded.min_time,
                change_url = excluded.change_url,
                is_unique = excluded.is_unique,
                last_changed = excluded.last_changed,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(spec.kind.as_str())
        .bind(credential)
        .bind(&spec.api_key)
        .bind(&spec.change_url)
        .bind(spec.min_time)
        .bind(spec.fingerprint())
        .bind(spec.unique)
        .bind(last_changed)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Pick one eligible entry, or none
    ///
    /// The predicate lives in SQL so selection is atomic with respect to
    /// concurrent row updates. Ordering is deterministic: non-unique entries
    /// first (always eligible), then least-used, then lowest id.
    pub async fn select_candidate(&self, max_used: i64, now: i64) -> Result<Option<ProxyEntry>> {
        let entry = sqlx::query_as::<_, ProxyEntry>(&format!(
            r#"
            SELECT {}
            FROM proxies
            WHERE last_error = ''
              AND (
                is_unique = 0
                OR (kind = 'static' AND running = 0
                    AND (used < ?1 OR (min_time > 0 AND ?2 - last_changed >= min_time)))
                OR (kind = 'mobilehop' AND running = 0)
                OR (kind NOT IN ('static', 'mobilehop') AND running = 0
                    AND (used < ?1 OR min_time = 0 OR ?2 - last_changed >= min_time))
              )
            ORDER BY is_unique ASC, used ASC, id ASC
            LIMIT 1
            "#,
            ENTRY_COLUMNS
        ))
        .bind(max_used)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    /// Conditionally take the running flag
    ///
    /// Two acquires may race on the same candidate; the `running = 0` guard
    /// lets at most one win. Returns whether this caller won.
    pub async fn try_mark_running(&self, id: i64, now: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE proxies SET running = 1, updated_at = ?2 WHERE id = ?1 AND running = 0",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Clear the running flag
    pub async fn mark_released(&self, id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE proxies SET running = 0, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Count one more hand-out without rotating
    pub async fn increment_used(&self, id: i64, now: i64) -> Result<()> {
        sqlx::query("UPDATE proxies SET used = used + 1, updated_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a successful rotation: usage restarts at 1, quarantine clears
    pub async fn record_rotation(
        &self,
        id: i64,
        credential: Option<&str>,
        now: i64,
    ) -> Result<()> {
        match credential {
            Some(credential) => {
                sqlx::query(
                    "UPDATE proxies SET credential = ?2, used = 1, last_changed = ?3, last_error = '', updated_at = ?3 WHERE id = ?1",
                )
                .bind(id)
                .bind(credential)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE proxies SET used = 1, last_changed = ?2, last_error = '', updated_at = ?2 WHERE id = ?1",
                )
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    /// Record a rotation failure; the entry stays out of selection until
    /// `clear_error`
    pub async fn record_error(&self, id: i64, message: &str, now: i64) -> Result<()> {
        sqlx::query("UPDATE proxies SET last_error = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id)
            .bind(message)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Lift a quarantine; reports whether the entry exists
    pub async fn clear_error(&self, id: i64, now: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE proxies SET last_error = '', updated_at = ?2 WHERE id = ?1")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Bulk-reset lease state on every entry (configure without clear-all)
    pub async fn reset_all(&self, now: i64) -> Result<()> {
        sqlx::query(
            "UPDATE proxies SET used = 0, running = 0, last_error = '', updated_at = ?1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop every entry
    pub async fn truncate(&self) -> Result<()> {
        let result = sqlx::query("DELETE FROM proxies").execute(&self.pool).await?;
        info!(count = result.rows_affected(), "Cleared proxy catalog");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::models::parse_proxy_line;

    async fn test_repo() -> ProxyRepository {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        ProxyRepository::new(db.pool().clone())
    }

    async fn load(repo: &ProxyRepository, line: &str, now: i64) -> i64 {
        let spec = parse_proxy_line(line).unwrap();
        let credential = spec.credential.clone();
        repo.upsert(&spec, &credential, now, now).await.unwrap()
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_fingerprint() {
        let repo = test_repo().await;

        let id1 = load(&repo, "static|1.2.3.4:8080:u:p", 100).await;
        let id2 = load(&repo, "static|1.2.3.4:8080:u:p", 200).await;

        assert_eq!(id1, id2);
        assert_eq!(repo.count_total().await.unwrap(), 1);

        let entry = repo.get_by_id(id1).await.unwrap().unwrap();
        assert_eq!(entry.last_changed, 200);
        assert_eq!(entry.used, 0);
    }

    #[tokio::test]
    async fn test_upsert_collision_keeps_counters() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p", 100).await;
        repo.increment_used(id, 110).await.unwrap();
        repo.try_mark_running(id, 110).await.unwrap();

        let again = load(&repo, "static|1.2.3.4:8080:u:p|30", 120).await;
        assert_eq!(again, id);

        let entry = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.used, 1);
        assert!(entry.running);
        assert_eq!(entry.min_time, 30);
    }

    #[tokio::test]
    async fn test_select_skips_quarantined() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p", 100).await;
        assert!(repo.select_candidate(5, 100).await.unwrap().is_some());

        repo.record_error(id, "vendor down", 110).await.unwrap();
        assert!(repo.select_candidate(5, 110).await.unwrap().is_none());

        repo.clear_error(id, 120).await.unwrap();
        assert!(repo.select_candidate(5, 120).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_select_static_cap_and_min_time_escape() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p|10", 1_000).await;

        // Exhaust the usage cap.
        sqlx::query("UPDATE proxies SET used = 100 WHERE id = ?1")
            .bind(id)
            .execute(repo.pool_for_tests())
            .await
            .unwrap();

        // Within min_time: nothing eligible.
        assert!(repo.select_candidate(5, 1_005).await.unwrap().is_none());
        // min_time elapsed: eligible again despite the cap.
        assert!(repo.select_candidate(5, 1_020).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_select_static_without_min_time_stays_exhausted() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p", 1_000).await;
        sqlx::query("UPDATE proxies SET used = 2 WHERE id = ?1")
            .bind(id)
            .execute(repo.pool_for_tests())
            .await
            .unwrap();

        assert!(repo.select_candidate(2, 9_999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_mobilehop_ignores_usage() {
        let repo = test_repo().await;

        let id = load(
            &repo,
            "mobilehop|1.2.3.4:8080:u:p|http://reset.example/change",
            1_000,
        )
        .await;
        sqlx::query("UPDATE proxies SET used = 500 WHERE id = ?1")
            .bind(id)
            .execute(repo.pool_for_tests())
            .await
            .unwrap();

        assert!(repo.select_candidate(5, 1_000).await.unwrap().is_some());

        repo.try_mark_running(id, 1_001).await.unwrap();
        assert!(repo.select_candidate(5, 1_001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_select_prefers_non_unique_then_least_used() {
        let repo = test_repo().await;

        let a = load(&repo, "static|1.1.1.1:80:u:p", 100).await;
        let b = load(&repo, "static|2.2.2.2:80:u:p", 100).await;
        let sticky = load(&repo, "sticky|h:3010:user-{random}:pw", 100).await;

        // Non-unique sticky wins regardless of usage.
        repo.increment_used(a, 100).await.unwrap();
        let picked = repo.select_candidate(10, 100).await.unwrap().unwrap();
        assert_eq!(picked.id, sticky);

        // Remove the sticky; least-used static wins, ties broken by id.
        sqlx::query("DELETE FROM proxies WHERE id = ?1")
            .bind(sticky)
            .execute(repo.pool_for_tests())
            .await
            .unwrap();
        let picked = repo.select_candidate(10, 100).await.unwrap().unwrap();
        assert_eq!(picked.id, b);
    }

    #[tokio::test]
    async fn test_try_mark_running_is_conditional() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p", 100).await;

        assert!(repo.try_mark_running(id, 101).await.unwrap());
        assert!(!repo.try_mark_running(id, 102).await.unwrap());

        repo.mark_released(id, 103).await.unwrap();
        assert!(repo.try_mark_running(id, 104).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_rotation_resets_usage() {
        let repo = test_repo().await;

        let id = load(&repo, "tmproxy|abc|60", 100).await;
        repo.increment_used(id, 100).await.unwrap();
        repo.increment_used(id, 100).await.unwrap();
        repo.record_error(id, "boom", 100).await.unwrap();

        repo.record_rotation(id, Some("5.6.7.8:9090:u:p"), 200)
            .await
            .unwrap();

        let entry = repo.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.used, 1);
        assert_eq!(entry.credential, "5.6.7.8:9090:u:p");
        assert_eq!(entry.last_changed, 200);
        assert!(entry.last_error.is_empty());
    }

    #[tokio::test]
    async fn test_reset_all_and_truncate() {
        let repo = test_repo().await;

        let id = load(&repo, "static|1.2.3.4:8080:u:p", 100).await;
        load(&repo, "static|5.6.7.8:9090:u:p", 100).await;
        repo.try_mark_running(id, 100).await.unwrap();
        repo.increment_used(id, 100).await.unwrap();
        repo.record_error(id, "boom", 100).await.unwrap();

        repo.reset_all(200).await.unwrap();
        let entry = repo.get_by_id(id).await.unwrap().unwrap();
        assert!(!entry.running);
        assert_eq!(entry.used, 0);
        assert!(entry.last_error.is_empty());

        repo.truncate().await.unwrap();
        assert_eq!(repo.count_total().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_errors_shape() {
        let repo = test_repo().await;

        let id = load(&repo, "tmproxy|abc|60", 100).await;
        load(&repo, "static|1.2.3.4:8080:u:p", 100).await;
        repo.record_error(id, "GetNewProxy failed: timeout", 150)
            .await
            .unwrap();

        let errors = repo.list_errors().await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, id);
        assert_eq!(errors[0].kind, "tmproxy");
        assert_eq!(errors[0].api_key, "abc");
        assert_eq!(errors[0].error, "GetNewProxy failed: timeout");
        assert_eq!(errors[0].updated_at, 150);
    }

    impl ProxyRepository {
        fn pool_for_tests(&self) -> &SqlitePool {
            &self.pool
        }
    }
}

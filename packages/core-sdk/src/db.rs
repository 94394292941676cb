use std::collections::HashMap;
use std::{thread, time::Duration};

use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{Order, OrderInput};

/**
 * \brief 审计日志条目。
 */
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /** \brief 行主键。 */
    pub id: i64,
    /** \brief 操作者标识。 */
    pub actor: String,
    /** \brief 动作（lockdown/unlock）。 */
    pub action: String,
    /** \brief 结果（granted/denied）。 */
    pub outcome: String,
    /** \brief 原因说明。 */
    pub reason: String,
    /** \brief 记录时间（RFC 3339）。 */
    pub created_at: String,
}

/**
 * \brief 打开默认数据库文件（本地目录下的 inkpress.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let conn = Connection::open("inkpress.db")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            customer TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            quantity INTEGER NOT NULL DEFAULT 1,
            notes TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS provider_settings (
            provider_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (provider_id, key)
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            outcome TEXT NOT NULL,
            reason TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        "#,
        )
    })?;

    ensure_orders_notes_column(conn)?;
    Ok(())
}

/**
 * \brief 兼容旧库：orders 表缺少 notes 列时补齐。
 */
fn ensure_orders_notes_column(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(orders)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == "notes" {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                "ALTER TABLE orders ADD COLUMN notes TEXT NOT NULL DEFAULT ''",
                [],
            )
        })?;
    }
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
}

fn set_string_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

fn get_string_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set_string_config(conn, key, if value { "1" } else { "0" })
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    Ok(get_string_config(conn, key)?
        .map(|s| s == "1")
        .unwrap_or(default))
}

/**
 * \brief 新增订单，返回主键。
 */
pub fn insert_order(conn: &Connection, input: &OrderInput) -> Result<i64> {
    let created_at = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO orders (title, customer, status, quantity, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                input.title,
                input.customer,
                input.status,
                input.quantity,
                input.notes,
                created_at
            ],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 更新订单全部业务字段。
 */
pub fn update_order(conn: &Connection, id: i64, input: &OrderInput) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE orders SET title=?1, customer=?2, status=?3, quantity=?4, notes=?5 WHERE id=?6",
            params![
                input.title,
                input.customer,
                input.status,
                input.quantity,
                input.notes,
                id
            ],
        )
    })?;
    if rows == 0 {
        bail!("order id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 仅变更订单状态。
 */
pub fn update_order_status(conn: &Connection, id: i64, status: &str) -> Result<()> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE orders SET status=?1 WHERE id=?2",
            params![status, id],
        )
    })?;
    if rows == 0 {
        bail!("order id {} not found", id);
    }
    Ok(())
}

/**
 * \brief 删除订单。
 */
pub fn delete_order(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM orders WHERE id=?1", params![id]))?;
    Ok(())
}

fn map_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    Ok(Order {
        id: row.get(0)?,
        title: row.get(1)?,
        customer: row.get(2)?,
        status: row.get(3)?,
        quantity: row.get(4)?,
        notes: row.get(5)?,
        created_at: row.get(6)?,
    })
}

/**
 * \brief 按 ID 获取订单。
 */
pub fn get_order_by_id(conn: &Connection, id: i64) -> Result<Option<Order>> {
    conn.query_row(
        "SELECT id, title, customer, status, quantity, notes, created_at FROM orders WHERE id=?1",
        params![id],
        map_order,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部订单（未过滤视图，门禁在上层应用）。
 */
pub fn list_orders(conn: &Connection) -> Result<Vec<Order>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, customer, status, quantity, notes, created_at FROM orders ORDER BY id DESC",
    )?;
    let rows = stmt
        .query_map([], map_order)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按状态聚合订单数量。
 */
pub fn count_orders_by_status(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM orders GROUP BY status ORDER BY status ASC")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 写入单个 Provider 配置项。
 */
pub fn set_provider_setting(
    conn: &Connection,
    provider_id: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO provider_settings (provider_id, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(provider_id, key) DO UPDATE SET value=excluded.value",
            params![provider_id, key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取指定 Provider 的全部配置项。
 */
pub fn get_provider_settings(conn: &Connection, provider_id: &str) -> Result<HashMap<String, String>> {
    let mut stmt =
        conn.prepare("SELECT key, value FROM provider_settings WHERE provider_id=?1")?;
    let mut rows = stmt.query(params![provider_id])?;
    let mut out = HashMap::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        let value: String = row.get(1)?;
        out.insert(key, value);
    }
    Ok(out)
}

/** \brief 读取门禁启用标志。 */
pub fn get_firewall_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "firewall_enabled", false)
}

/** \brief 写入门禁启用标志。 */
pub fn set_firewall_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "firewall_enabled", enabled)
}

/** \brief 读取封锁标志。 */
pub fn get_firewall_lockdown(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "firewall_lockdown", false)
}

/** \brief 写入封锁标志。 */
pub fn set_firewall_lockdown(conn: &Connection, lockdown: bool) -> Result<()> {
    set_bool_config(conn, "firewall_lockdown", lockdown)
}

/** \brief 读取门禁密钥（未设置时返回空串）。 */
pub fn get_firewall_secret(conn: &Connection) -> Result<String> {
    Ok(get_string_config(conn, "firewall_secret")?.unwrap_or_default())
}

/** \brief 写入门禁密钥（空串表示清除）。 */
pub fn set_firewall_secret(conn: &Connection, secret: &str) -> Result<()> {
    set_string_config(conn, "firewall_secret", secret)
}

/**
 * \brief 追加一条审计记录。
 */
pub fn append_audit(
    conn: &Connection,
    actor: &str,
    action: &str,
    outcome: &str,
    reason: &str,
) -> Result<i64> {
    let created_at = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO audit_log (actor, action, outcome, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![actor, action, outcome, reason, created_at],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 读取最近的审计记录，按时间倒序。
 */
pub fn list_audit(conn: &Connection, limit: i64) -> Result<Vec<AuditEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, outcome, reason, created_at FROM audit_log
         ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                outcome: row.get(3)?,
                reason: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn sample_order(title: &str, notes: &str) -> OrderInput {
        OrderInput {
            title: title.to_string(),
            customer: "Acme Press".to_string(),
            status: "pending".to_string(),
            quantity: 100,
            notes: notes.to_string(),
        }
    }

    #[test]
    fn test_order_crud() {
        let conn = mem_conn();
        let id = insert_order(&conn, &sample_order("Field Guide", "")).expect("insert order");
        let fetched = get_order_by_id(&conn, id).expect("get order").unwrap();
        assert_eq!(fetched.title, "Field Guide");
        assert_eq!(fetched.status, "pending");
        assert_eq!(fetched.quantity, 100);

        update_order_status(&conn, id, "printing").expect("update status");
        let fetched = get_order_by_id(&conn, id).expect("get order").unwrap();
        assert_eq!(fetched.status, "printing");

        let mut input = sample_order("Field Guide 2nd ed.", "rush job");
        input.quantity = 250;
        update_order(&conn, id, &input).expect("update order");
        let fetched = get_order_by_id(&conn, id).expect("get order").unwrap();
        assert_eq!(fetched.title, "Field Guide 2nd ed.");
        assert_eq!(fetched.notes, "rush job");
        assert_eq!(fetched.quantity, 250);

        delete_order(&conn, id).expect("delete order");
        assert!(get_order_by_id(&conn, id).expect("get order").is_none());
    }

    #[test]
    fn test_update_missing_order_fails() {
        let conn = mem_conn();
        assert!(update_order_status(&conn, 42, "printing").is_err());
        assert!(update_order(&conn, 42, &sample_order("x", "")).is_err());
    }

    #[test]
    fn test_count_orders_by_status() {
        let conn = mem_conn();
        insert_order(&conn, &sample_order("a", "")).expect("insert");
        insert_order(&conn, &sample_order("b", "")).expect("insert");
        let mut shipped = sample_order("c", "");
        shipped.status = "shipped".to_string();
        insert_order(&conn, &shipped).expect("insert");

        let counts = count_orders_by_status(&conn).expect("counts");
        assert_eq!(counts.len(), 2);
        assert!(counts.contains(&("pending".to_string(), 2)));
        assert!(counts.contains(&("shipped".to_string(), 1)));
    }

    #[test]
    fn test_provider_settings_roundtrip() {
        let conn = mem_conn();
        set_provider_setting(&conn, "gpt", "api_key", "sk-test").expect("set");
        set_provider_setting(&conn, "gpt", "model", "gpt-4o-mini").expect("set");
        set_provider_setting(&conn, "gpt", "api_key", "sk-test-2").expect("overwrite");

        let settings = get_provider_settings(&conn, "gpt").expect("get");
        assert_eq!(settings.get("api_key").map(String::as_str), Some("sk-test-2"));
        assert_eq!(settings.get("model").map(String::as_str), Some("gpt-4o-mini"));
        assert!(get_provider_settings(&conn, "gemini").expect("get").is_empty());
    }

    #[test]
    fn test_firewall_flags_default_off() {
        let conn = mem_conn();
        assert!(!get_firewall_enabled(&conn).expect("enabled"));
        assert!(!get_firewall_lockdown(&conn).expect("lockdown"));
        assert_eq!(get_firewall_secret(&conn).expect("secret"), "");

        set_firewall_enabled(&conn, true).expect("set enabled");
        set_firewall_lockdown(&conn, true).expect("set lockdown");
        set_firewall_secret(&conn, "0123456789abcdef0123456789abcdef").expect("set secret");
        assert!(get_firewall_enabled(&conn).expect("enabled"));
        assert!(get_firewall_lockdown(&conn).expect("lockdown"));
        assert_eq!(
            get_firewall_secret(&conn).expect("secret"),
            "0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn test_audit_append_and_list() {
        let conn = mem_conn();
        append_audit(&conn, "cron", "lockdown", "denied", "secret mismatch").expect("append");
        append_audit(&conn, "admin", "lockdown", "granted", "secret match").expect("append");

        let entries = list_audit(&conn, 10).expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].actor, "admin");
        assert_eq!(entries[0].outcome, "granted");
        assert_eq!(entries[1].actor, "cron");
        assert_eq!(entries[1].outcome, "denied");
    }
}

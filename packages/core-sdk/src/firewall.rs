use rusqlite::Connection;
use thiserror::Error;

use crate::db;
use crate::models::{Order, Role};
use crate::telemetry;

/** \brief 备注字段里的机密标记（大小写不敏感）。 */
pub const CONFIDENTIAL_MARKER: &str = "@war#";

/** \brief 门禁密钥的最小长度。 */
pub const MIN_SECRET_LEN: usize = 32;

/**
 * \brief 门禁层错误分类。
 */
#[derive(Debug, Error)]
pub enum FirewallError {
    /** \brief 密钥不匹配或未配置，拒绝状态变更。 */
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    /** \brief 设置保存前的校验失败，整次调用不生效。 */
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for FirewallError {
    fn from(e: anyhow::Error) -> FirewallError {
        FirewallError::Storage(e.to_string())
    }
}

/**
 * \brief 门禁状态快照。
 * \details 显式注入到各过滤操作，不读进程级全局；读取与过滤之间允许短暂不一致。
 */
#[derive(Debug, Clone, Default)]
pub struct FirewallSettings {
    /** \brief 功能总开关，默认关闭。 */
    pub enabled: bool,
    /** \brief 封锁开关：连内部角色也看不到受限订单。 */
    pub lockdown: bool,
    /** \brief 授权封锁切换的密钥，空串表示未配置。 */
    pub secret: String,
}

impl FirewallSettings {
    /**
     * \brief 从配置存储加载当前快照。
     */
    pub fn load(conn: &Connection) -> anyhow::Result<FirewallSettings> {
        Ok(FirewallSettings {
            enabled: db::get_firewall_enabled(conn)?,
            lockdown: db::get_firewall_lockdown(conn)?,
            secret: db::get_firewall_secret(conn)?,
        })
    }
}

/**
 * \brief 订单是否受限：门禁关闭时一律 false，否则看备注里是否含标记。
 */
pub fn is_restricted(settings: &FirewallSettings, order: &Order) -> bool {
    if !settings.enabled {
        return false;
    }
    order.notes.to_lowercase().contains(CONFIDENTIAL_MARKER)
}

/**
 * \brief 按请求方角色过滤展示列表。
 * \details 外部角色（含未识别角色，见 Role::from_id）永远看不到受限订单；
 *          内部角色仅在封锁期间被隐藏。门禁关闭时原样返回。
 */
pub fn filter_for_display(
    settings: &FirewallSettings,
    orders: Vec<Order>,
    role: Role,
) -> Vec<Order> {
    if !settings.enabled {
        return orders;
    }
    orders
        .into_iter()
        .filter(|order| {
            if !is_restricted(settings, order) {
                return true;
            }
            role.is_internal() && !settings.lockdown
        })
        .collect()
}

/**
 * \brief 是否允许对该订单发送通知。受限订单静默，其余（含门禁关闭时）照常。
 */
pub fn should_notify(settings: &FirewallSettings, order: &Order) -> bool {
    !is_restricted(settings, order)
}

// 全量比较后再汇总差异，不因首个不同字节提前返回。
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/**
 * \brief 切换封锁状态。密钥比对通过才生效；每次尝试（无论成败）都写审计。
 */
pub fn set_lockdown(
    conn: &Connection,
    target: bool,
    supplied_secret: &str,
    actor: &str,
) -> Result<(), FirewallError> {
    let action = if target { "lockdown" } else { "unlock" };
    let stored = db::get_firewall_secret(conn)?;

    if stored.is_empty() {
        db::append_audit(conn, actor, action, "denied", "no secret configured")?;
        telemetry::log_warn(
            "firewall.lockdown",
            &format!("actor={} action={} denied: no secret configured", actor, action),
        );
        return Err(FirewallError::Unauthorized("no secret configured"));
    }
    if !constant_time_eq(supplied_secret.as_bytes(), stored.as_bytes()) {
        db::append_audit(conn, actor, action, "denied", "secret mismatch")?;
        telemetry::log_warn(
            "firewall.lockdown",
            &format!("actor={} action={} denied: secret mismatch", actor, action),
        );
        return Err(FirewallError::Unauthorized("secret mismatch"));
    }

    db::set_firewall_lockdown(conn, target)?;
    db::append_audit(conn, actor, action, "granted", "secret match")?;
    telemetry::log_event(
        "firewall.lockdown",
        &format!("actor={} action={} granted", actor, action),
    );
    Ok(())
}

/**
 * \brief 保存门禁设置。先整体校验再落库：密钥非空且不足 32 字符时整次失败，
 *        enabled 与 secret 都不会改动。
 */
pub fn save_settings(
    conn: &Connection,
    new_enabled: Option<bool>,
    new_secret: Option<&str>,
) -> Result<FirewallSettings, FirewallError> {
    if let Some(secret) = new_secret {
        if !secret.is_empty() && secret.chars().count() < MIN_SECRET_LEN {
            return Err(FirewallError::ValidationFailed(format!(
                "secret must be empty or at least {} characters",
                MIN_SECRET_LEN
            )));
        }
    }

    if let Some(enabled) = new_enabled {
        db::set_firewall_enabled(conn, enabled)?;
        telemetry::log_event(
            "firewall.settings",
            &format!("enabled={}", enabled),
        );
    }
    if let Some(secret) = new_secret {
        db::set_firewall_secret(conn, secret)?;
        telemetry::log_event(
            "firewall.settings",
            if secret.is_empty() { "secret cleared" } else { "secret updated" },
        );
    }
    FirewallSettings::load(conn).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderInput;

    const GOOD_SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::migrate(&conn).expect("migrate");
        conn
    }

    fn order_with_notes(notes: &str) -> Order {
        Order {
            id: 1,
            title: "Atlas".to_string(),
            customer: "Acme Press".to_string(),
            status: "pending".to_string(),
            quantity: 10,
            notes: notes.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    fn settings(enabled: bool, lockdown: bool) -> FirewallSettings {
        FirewallSettings {
            enabled,
            lockdown,
            secret: GOOD_SECRET.to_string(),
        }
    }

    #[test]
    fn test_is_restricted_false_while_disabled() {
        let order = order_with_notes("@WAR# confidential");
        assert!(!is_restricted(&settings(false, false), &order));
    }

    #[test]
    fn test_is_restricted_marker_is_case_insensitive() {
        let order = order_with_notes("Please handle @war# carefully");
        assert!(is_restricted(&settings(true, false), &order));
        let order = order_with_notes("Please handle @WaR# carefully");
        assert!(is_restricted(&settings(true, false), &order));
        let order = order_with_notes("ordinary rush job");
        assert!(!is_restricted(&settings(true, false), &order));
    }

    #[test]
    fn test_filter_hides_restricted_from_customers_regardless_of_lockdown() {
        let orders = vec![order_with_notes("@war# vip"), order_with_notes("plain")];
        for lockdown in [false, true] {
            let visible =
                filter_for_display(&settings(true, lockdown), orders.clone(), Role::Customer);
            assert_eq!(visible.len(), 1);
            assert_eq!(visible[0].notes, "plain");
        }
    }

    #[test]
    fn test_filter_internal_roles_follow_lockdown() {
        let orders = vec![order_with_notes("@war# vip"), order_with_notes("plain")];
        let visible = filter_for_display(&settings(true, false), orders.clone(), Role::Staff);
        assert_eq!(visible.len(), 2);
        let visible = filter_for_display(&settings(true, true), orders.clone(), Role::Staff);
        assert_eq!(visible.len(), 1);
        let visible = filter_for_display(&settings(true, true), orders, Role::Admin);
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_filter_is_noop_while_disabled() {
        let orders = vec![order_with_notes("@war# vip"), order_with_notes("plain")];
        let visible = filter_for_display(&settings(false, true), orders, Role::Customer);
        assert_eq!(visible.len(), 2);
    }

    #[test]
    fn test_unknown_role_is_denied_like_customer() {
        let orders = vec![order_with_notes("@war# vip"), order_with_notes("plain")];
        let role = Role::from_id("warehouse-bot");
        let visible = filter_for_display(&settings(true, false), orders, role);
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_should_notify_silences_restricted_only() {
        let restricted = order_with_notes("@war# vip");
        let plain = order_with_notes("plain");
        assert!(!should_notify(&settings(true, false), &restricted));
        assert!(should_notify(&settings(true, false), &plain));
        assert!(should_notify(&settings(false, false), &restricted));
    }

    #[test]
    fn test_set_lockdown_denied_without_stored_secret() {
        let conn = mem_conn();
        let err = set_lockdown(&conn, true, GOOD_SECRET, "admin").unwrap_err();
        assert!(matches!(err, FirewallError::Unauthorized(_)));
        assert!(!db::get_firewall_lockdown(&conn).expect("lockdown"));

        let audit = db::list_audit(&conn, 10).expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, "denied");
        assert_eq!(audit[0].reason, "no secret configured");
    }

    #[test]
    fn test_set_lockdown_denied_on_mismatch() {
        let conn = mem_conn();
        db::set_firewall_secret(&conn, GOOD_SECRET).expect("set secret");
        let err = set_lockdown(&conn, true, "wrong-secret", "cron").unwrap_err();
        assert!(matches!(err, FirewallError::Unauthorized("secret mismatch")));
        assert!(!db::get_firewall_lockdown(&conn).expect("lockdown"));

        let audit = db::list_audit(&conn, 10).expect("audit");
        assert_eq!(audit[0].actor, "cron");
        assert_eq!(audit[0].outcome, "denied");
    }

    #[test]
    fn test_set_lockdown_flips_state_on_exact_match() {
        let conn = mem_conn();
        db::set_firewall_secret(&conn, GOOD_SECRET).expect("set secret");

        set_lockdown(&conn, true, GOOD_SECRET, "admin").expect("lockdown");
        assert!(db::get_firewall_lockdown(&conn).expect("lockdown"));
        set_lockdown(&conn, false, GOOD_SECRET, "admin").expect("unlock");
        assert!(!db::get_firewall_lockdown(&conn).expect("lockdown"));

        let audit = db::list_audit(&conn, 10).expect("audit");
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|e| e.outcome == "granted"));
    }

    #[test]
    fn test_save_settings_rejects_short_secret_without_applying() {
        let conn = mem_conn();
        db::set_firewall_secret(&conn, GOOD_SECRET).expect("seed secret");

        let short = "a".repeat(31);
        let err = save_settings(&conn, Some(true), Some(&short)).unwrap_err();
        assert!(matches!(err, FirewallError::ValidationFailed(_)));
        // 整体失败：enabled 和 secret 都未动
        assert!(!db::get_firewall_enabled(&conn).expect("enabled"));
        assert_eq!(db::get_firewall_secret(&conn).expect("secret"), GOOD_SECRET);
    }

    #[test]
    fn test_save_settings_accepts_empty_secret_as_clear() {
        let conn = mem_conn();
        db::set_firewall_secret(&conn, GOOD_SECRET).expect("seed secret");
        let saved = save_settings(&conn, Some(true), Some("")).expect("save");
        assert!(saved.enabled);
        assert_eq!(saved.secret, "");
    }

    #[test]
    fn test_save_settings_partial_update() {
        let conn = mem_conn();
        let saved = save_settings(&conn, Some(true), None).expect("save");
        assert!(saved.enabled);
        assert_eq!(saved.secret, "");
        let saved = save_settings(&conn, None, Some(GOOD_SECRET)).expect("save");
        assert!(saved.enabled);
        assert_eq!(saved.secret, GOOD_SECRET);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_end_to_end_visibility_scenario() {
        let conn = mem_conn();
        save_settings(&conn, Some(true), Some(GOOD_SECRET)).expect("enable gate");

        for notes in ["", "", "ship via @war# channel"] {
            db::insert_order(
                &conn,
                &OrderInput {
                    title: "Atlas".to_string(),
                    customer: "Acme Press".to_string(),
                    status: "pending".to_string(),
                    quantity: 10,
                    notes: notes.to_string(),
                },
            )
            .expect("insert order");
        }

        let settings = FirewallSettings::load(&conn).expect("load settings");
        let all = db::list_orders(&conn).expect("list");
        assert_eq!(
            filter_for_display(&settings, all.clone(), Role::Staff).len(),
            3
        );
        assert_eq!(
            filter_for_display(&settings, all.clone(), Role::Customer).len(),
            2
        );

        set_lockdown(&conn, true, GOOD_SECRET, "admin").expect("lockdown");
        let settings = FirewallSettings::load(&conn).expect("reload settings");
        assert_eq!(filter_for_display(&settings, all, Role::Staff).len(), 2);
    }
}

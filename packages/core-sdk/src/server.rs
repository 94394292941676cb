use std::collections::HashMap;

use anyhow::{anyhow, Result};
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::services::ServeDir;

use crate::assistant::{AssistantError, AssistantKind, ALL_ASSISTANTS};
use crate::firewall::{self, FirewallError, FirewallSettings};
use crate::llm::{self, LlmError, ProviderConfig, ProviderKind, ALL_PROVIDERS};
use crate::models::{is_valid_status, Order, OrderInput, Role};
use crate::{db, telemetry};

/**
 * \brief 启动本地 HTTP 服务，提供静态管理页与 API。
 * \param addr 监听地址，如 "127.0.0.1:8090"
 */
pub async fn run(addr: &str) -> Result<()> {
    let ui_root = std::env::var("INKPRESS_UI_DIR").unwrap_or_else(|_| "web".to_string());
    let static_service =
        get_service(ServeDir::new(ui_root).append_index_html_on_directories(true));

    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/api/orders/{id}", put(update_order).delete(delete_order))
        .route("/api/providers", get(list_providers))
        .route("/api/providers/{id}", put(save_provider_settings))
        .route("/api/providers/{id}/validate", post(validate_provider))
        .route("/api/assistants", get(list_assistants))
        .route("/api/assistants/{id}/ask", post(ask_assistant))
        .route("/api/firewall", get(get_firewall).post(save_firewall))
        .route("/api/firewall/audit", get(list_firewall_audit))
        .route("/api/firewall/emergency", get(firewall_emergency))
        .fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({"ok": true}))
}

#[derive(Serialize, Debug)]
struct OrderDto {
    id: i64,
    title: String,
    customer: String,
    status: String,
    quantity: i64,
    notes: String,
    created_at: String,
    /** \brief 计算字段：当前门禁状态下是否受限。 */
    restricted: bool,
}

fn order_dto(settings: &FirewallSettings, order: Order) -> OrderDto {
    let restricted = firewall::is_restricted(settings, &order);
    OrderDto {
        id: order.id,
        title: order.title,
        customer: order.customer,
        status: order.status,
        quantity: order.quantity,
        notes: order.notes,
        created_at: order.created_at,
        restricted,
    }
}

#[derive(Deserialize, Debug)]
struct OrdersQuery {
    /** \brief 请求方角色，缺省按 customer（外部）处理。 */
    role: Option<String>,
}

#[derive(Serialize, Debug)]
struct OrderListResponse {
    orders: Vec<OrderDto>,
}

/**
 * \brief 列出订单，按请求方角色过滤受限条目。
 */
async fn list_orders(
    Query(q): Query<OrdersQuery>,
) -> Result<Json<OrderListResponse>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let role = Role::from_id(q.role.as_deref().unwrap_or("customer"));
    let settings = FirewallSettings::load(&conn).map_err(internal_err)?;
    let all = db::list_orders(&conn).map_err(internal_err)?;
    let visible = firewall::filter_for_display(&settings, all, role);
    let orders = visible
        .into_iter()
        .map(|o| order_dto(&settings, o))
        .collect();
    Ok(Json(OrderListResponse { orders }))
}

/**
 * \brief 新建订单。受限订单不触发任何通知事件。
 */
async fn create_order(
    Json(input): Json<OrderInput>,
) -> Result<Json<OrderDto>, (StatusCode, String)> {
    if !is_valid_status(&input.status) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("unknown order status: {}", input.status),
        ));
    }
    let conn = db::open_default_db().map_err(internal_err)?;
    let id = db::insert_order(&conn, &input).map_err(internal_err)?;
    let order = db::get_order_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| internal_err(anyhow!("order {} vanished after insert", id)))?;

    let settings = FirewallSettings::load(&conn).map_err(internal_err)?;
    if firewall::should_notify(&settings, &order) {
        telemetry::log_event(
            "server.orders",
            &format!("create id={} title={} status={}", id, order.title, order.status),
        );
    }
    Ok(Json(order_dto(&settings, order)))
}

/**
 * \brief 更新订单。
 */
async fn update_order(
    Path(id): Path<i64>,
    Json(input): Json<OrderInput>,
) -> Result<Json<OrderDto>, (StatusCode, String)> {
    if !is_valid_status(&input.status) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("unknown order status: {}", input.status),
        ));
    }
    let conn = db::open_default_db().map_err(internal_err)?;
    db::update_order(&conn, id, &input).map_err(internal_err)?;
    let order = db::get_order_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| internal_err(anyhow!("order {} not found", id)))?;

    let settings = FirewallSettings::load(&conn).map_err(internal_err)?;
    if firewall::should_notify(&settings, &order) {
        telemetry::log_event(
            "server.orders",
            &format!("update id={} status={}", id, order.status),
        );
    }
    Ok(Json(order_dto(&settings, order)))
}

/**
 * \brief 删除订单。
 */
async fn delete_order(Path(id): Path<i64>) -> Result<Json<Value>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    db::delete_order(&conn, id).map_err(internal_err)?;
    telemetry::log_event("server.orders", &format!("delete id={}", id));
    Ok(Json(serde_json::json!({"deleted": id})))
}

#[derive(Serialize, Debug)]
struct ProviderFieldDto {
    key: &'static str,
    label: &'static str,
    field_type: &'static str,
    required: bool,
    default: Option<&'static str>,
    options: &'static [&'static str],
    description: &'static str,
    /** \brief 已存值；password 类型只回传是否已设置。 */
    value: String,
}

#[derive(Serialize, Debug)]
struct ProviderDto {
    id: &'static str,
    name: &'static str,
    endpoint: &'static str,
    max_tokens: u32,
    configured: bool,
    fields: Vec<ProviderFieldDto>,
}

fn provider_dto(conn: &rusqlite::Connection, kind: ProviderKind) -> Result<ProviderDto> {
    let stored = db::get_provider_settings(conn, kind.id())?;
    let cfg = ProviderConfig::new(stored.clone());
    let fields = kind
        .config_fields()
        .iter()
        .map(|f| {
            let raw = stored.get(f.key).cloned().unwrap_or_default();
            let value = if f.field_type == "password" && !raw.is_empty() {
                "••••".to_string()
            } else {
                raw
            };
            ProviderFieldDto {
                key: f.key,
                label: f.label,
                field_type: f.field_type,
                required: f.required,
                default: f.default,
                options: f.options,
                description: f.description,
                value,
            }
        })
        .collect();
    Ok(ProviderDto {
        id: kind.id(),
        name: kind.display_name(),
        endpoint: kind.endpoint(),
        max_tokens: kind.max_tokens(),
        configured: kind.is_configured(&cfg),
        fields,
    })
}

/**
 * \brief Provider 目录：静态元数据 + 配置状态（密钥掩码）。
 */
async fn list_providers() -> Result<Json<Value>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let mut providers = Vec::new();
    for kind in ALL_PROVIDERS {
        providers.push(provider_dto(&conn, *kind).map_err(internal_err)?);
    }
    Ok(Json(serde_json::json!({ "providers": providers })))
}

#[derive(Deserialize, Debug)]
struct ProviderSettingsRequest {
    settings: HashMap<String, String>,
}

fn lookup_provider(id: &str) -> Result<ProviderKind, (StatusCode, String)> {
    ProviderKind::from_id(id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown provider: {}", id)))
}

/**
 * \brief 保存 Provider 配置项，只接受该 Provider 声明过的键。
 */
async fn save_provider_settings(
    Path(id): Path<String>,
    Json(payload): Json<ProviderSettingsRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let kind = lookup_provider(&id)?;
    let declared: Vec<&str> = kind.config_fields().iter().map(|f| f.key).collect();
    for key in payload.settings.keys() {
        if !declared.contains(&key.as_str()) {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("provider {} does not declare field {}", kind.id(), key),
            ));
        }
    }

    let conn = db::open_default_db().map_err(internal_err)?;
    for (key, value) in &payload.settings {
        db::set_provider_setting(&conn, kind.id(), key, value).map_err(internal_err)?;
    }
    telemetry::log_event(
        "server.providers",
        &format!("save provider={} keys={}", kind.id(), payload.settings.len()),
    );

    let cfg = ProviderConfig::new(db::get_provider_settings(&conn, kind.id()).map_err(internal_err)?);
    Ok(Json(serde_json::json!({
        "id": kind.id(),
        "configured": kind.is_configured(&cfg),
    })))
}

#[derive(Deserialize, Debug)]
struct ValidateRequest {
    /** \brief 候选配置；缺省时用已存配置探测。 */
    #[serde(default)]
    settings: Option<HashMap<String, String>>,
}

/**
 * \brief 凭证预检：用候选（未保存）或已存配置发一次最小探测。
 */
async fn validate_provider(
    Path(id): Path<String>,
    Json(payload): Json<ValidateRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let kind = lookup_provider(&id)?;
    let cfg = match payload.settings {
        Some(candidate) => ProviderConfig::new(candidate),
        None => {
            let conn = db::open_default_db().map_err(internal_err)?;
            ProviderConfig::new(db::get_provider_settings(&conn, kind.id()).map_err(internal_err)?)
        }
    };
    match llm::validate_credentials(kind, &cfg).await {
        Ok(()) => Ok(Json(serde_json::json!({"ok": true, "provider": kind.id()}))),
        Err(e) => {
            telemetry::log_error(
                "server.providers",
                &format!("validate provider={} failed: {}", kind.id(), e),
            );
            Ok(Json(serde_json::json!({
                "ok": false,
                "provider": kind.id(),
                "error": e.to_string(),
            })))
        }
    }
}

#[derive(Serialize, Debug)]
struct AssistantDto {
    id: &'static str,
    name: &'static str,
    description: &'static str,
    roles: Vec<&'static str>,
    capabilities: &'static [&'static str],
    provider: &'static str,
}

/**
 * \brief 助手目录。
 */
async fn list_assistants() -> Json<Value> {
    let assistants: Vec<AssistantDto> = ALL_ASSISTANTS
        .iter()
        .map(|a| AssistantDto {
            id: a.id(),
            name: a.display_name(),
            description: a.description(),
            roles: a.allowed_roles().iter().map(|r| r.as_str()).collect(),
            capabilities: a.capabilities(),
            provider: a.preferred_provider().id(),
        })
        .collect();
    Json(serde_json::json!({ "assistants": assistants }))
}

#[derive(Deserialize, Debug)]
struct AskRequest {
    prompt: String,
    role: String,
    #[serde(default)]
    context: Option<Map<String, Value>>,
}

fn assistant_err(e: AssistantError) -> (StatusCode, String) {
    let status = match &e {
        AssistantError::Forbidden(_) => StatusCode::FORBIDDEN,
        AssistantError::Llm(LlmError::NotConfigured(_)) => StatusCode::CONFLICT,
        AssistantError::Llm(_) => StatusCode::BAD_GATEWAY,
        AssistantError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/**
 * \brief 向助手提问。Provider 的错误信息原样返回给调用方。
 */
async fn ask_assistant(
    Path(id): Path<String>,
    Json(payload): Json<AskRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let assistant = AssistantKind::from_id(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("unknown assistant: {}", id)))?;
    let role = Role::from_id(&payload.role);
    let conn = db::open_default_db().map_err(internal_err)?;
    let base = payload.context.unwrap_or_default();

    telemetry::log_event(
        "server.assistants",
        &format!(
            "ask assistant={} role={} prompt_len={}",
            assistant.id(),
            role.as_str(),
            payload.prompt.len()
        ),
    );

    let generation = assistant
        .process_request(&conn, &payload.prompt, &base, role)
        .await
        .map_err(|e| {
            telemetry::log_error(
                "server.assistants",
                &format!("ask assistant={} failed: {}", assistant.id(), e),
            );
            assistant_err(e)
        })?;
    Ok(Json(serde_json::json!({
        "assistant": assistant.id(),
        "text": generation.text,
        "model": generation.model,
        "tokens": generation.tokens,
    })))
}

#[derive(Deserialize, Debug)]
struct FirewallSaveRequest {
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    secret: Option<String>,
}

/**
 * \brief 查看门禁设置。密钥本身不回传，只给出是否已配置。
 */
async fn get_firewall() -> Result<Json<Value>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let settings = FirewallSettings::load(&conn).map_err(internal_err)?;
    Ok(Json(serde_json::json!({
        "enabled": settings.enabled,
        "lockdown": settings.lockdown,
        "secret_set": !settings.secret.is_empty(),
    })))
}

/**
 * \brief 保存门禁设置；校验失败时整次调用不生效。
 */
async fn save_firewall(
    Json(payload): Json<FirewallSaveRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let settings = firewall::save_settings(&conn, payload.enabled, payload.secret.as_deref())
        .map_err(|e| {
            let status = match &e {
                FirewallError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string())
        })?;
    Ok(Json(serde_json::json!({
        "enabled": settings.enabled,
        "lockdown": settings.lockdown,
        "secret_set": !settings.secret.is_empty(),
    })))
}

/**
 * \brief 最近的封锁切换审计记录。
 */
async fn list_firewall_audit() -> Result<Json<Value>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let entries = db::list_audit(&conn, 100).map_err(internal_err)?;
    let items: Vec<Value> = entries
        .into_iter()
        .map(|e| {
            serde_json::json!({
                "id": e.id,
                "actor": e.actor,
                "action": e.action,
                "outcome": e.outcome,
                "reason": e.reason,
                "created_at": e.created_at,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "audit": items })))
}

#[derive(Deserialize, Debug)]
struct EmergencyQuery {
    action: String,
    #[serde(default)]
    key: String,
}

/**
 * \brief 应急开关：GET /api/firewall/emergency?action=lockdown|unlock&key=...
 * \details 面向无登录态的定时任务调用，仅凭密钥放行；成功 200、拒绝 401，均为固定短文案。
 */
async fn firewall_emergency(Query(q): Query<EmergencyQuery>) -> (StatusCode, String) {
    let target = match q.action.as_str() {
        "lockdown" => true,
        "unlock" => false,
        other => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unknown action: {}", other),
            )
        }
    };
    let conn = match db::open_default_db() {
        Ok(conn) => conn,
        Err(e) => return internal_err(e),
    };
    match firewall::set_lockdown(&conn, target, &q.key, "emergency-endpoint") {
        Ok(()) => (
            StatusCode::OK,
            if target {
                "Lockdown engaged".to_string()
            } else {
                "Lockdown lifted".to_string()
            },
        ),
        Err(FirewallError::Unauthorized(_)) => {
            (StatusCode::UNAUTHORIZED, "Unauthorized".to_string())
        }
        Err(e) => internal_err(e),
    }
}

use rusqlite::Connection;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::db;
use crate::llm::{self, GenerateOptions, Generation, LlmError, ProviderConfig, ProviderKind};
use crate::models::Role;

/**
 * \brief 助手层错误分类。Provider 的失败原样向上传递，不做包装转换。
 */
#[derive(Debug, Error)]
pub enum AssistantError {
    /** \brief 请求方角色不在许可名单内。 */
    #[error("role {0} is not allowed to use this assistant")]
    Forbidden(&'static str),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for AssistantError {
    fn from(e: anyhow::Error) -> AssistantError {
        AssistantError::Storage(e.to_string())
    }
}

/**
 * \brief 内置助手目录。每个助手 = 角色门 + 固定系统提示词 + 偏好的 Provider。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantKind {
    /** \brief 订单台：围绕单个订单答疑。 */
    OrderDesk,
    /** \brief 产能统计：汇总各状态订单量。 */
    PrintStats,
    /** \brief 客服：面向客户的通用咨询。 */
    CustomerCare,
}

/** \brief 全部助手，供目录接口遍历。 */
pub const ALL_ASSISTANTS: &[AssistantKind] = &[
    AssistantKind::OrderDesk,
    AssistantKind::PrintStats,
    AssistantKind::CustomerCare,
];

impl AssistantKind {
    pub fn from_id(id: &str) -> Option<AssistantKind> {
        match id.to_ascii_lowercase().as_str() {
            "order-desk" => Some(AssistantKind::OrderDesk),
            "print-stats" => Some(AssistantKind::PrintStats),
            "customer-care" => Some(AssistantKind::CustomerCare),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            AssistantKind::OrderDesk => "order-desk",
            AssistantKind::PrintStats => "print-stats",
            AssistantKind::CustomerCare => "customer-care",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AssistantKind::OrderDesk => "Order Desk",
            AssistantKind::PrintStats => "Print Stats",
            AssistantKind::CustomerCare => "Customer Care",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            AssistantKind::OrderDesk => "Answers questions about a single print order",
            AssistantKind::PrintStats => "Summarizes production load across order statuses",
            AssistantKind::CustomerCare => "General help for customers tracking their books",
        }
    }

    /** \brief 许可角色名单。 */
    pub fn allowed_roles(&self) -> &'static [Role] {
        match self {
            AssistantKind::OrderDesk => &[Role::Staff, Role::Admin],
            AssistantKind::PrintStats => &[Role::Admin],
            AssistantKind::CustomerCare => &[Role::Customer, Role::Staff, Role::Admin],
        }
    }

    /** \brief 能力清单，仅作目录展示用。 */
    pub fn capabilities(&self) -> &'static [&'static str] {
        match self {
            AssistantKind::OrderDesk => &["order-lookup", "status-explanation", "note-drafting"],
            AssistantKind::PrintStats => &["status-aggregation", "load-summary"],
            AssistantKind::CustomerCare => &["faq", "tracking-help"],
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            AssistantKind::OrderDesk => {
                "You are the order desk of a book-printing workshop. Answer questions about \
                 the order given in the context. Be concise and never invent order details."
            }
            AssistantKind::PrintStats => {
                "You are a production analyst for a book-printing workshop. Use the order \
                 statistics in the context to describe the current workload."
            }
            AssistantKind::CustomerCare => {
                "You are a friendly support agent for a book-printing service. Help the \
                 customer with questions about printing, binding and delivery."
            }
        }
    }

    /** \brief 偏好的生成后端。 */
    pub fn preferred_provider(&self) -> ProviderKind {
        match self {
            AssistantKind::OrderDesk => ProviderKind::Gpt,
            AssistantKind::PrintStats => ProviderKind::DeepSeek,
            AssistantKind::CustomerCare => ProviderKind::Gemini,
        }
    }

    /**
     * \brief 角色是否可用此助手（纯集合判断）。
     */
    pub fn can_access(&self, role: Role) -> bool {
        self.allowed_roles().contains(&role)
    }

    /**
     * \brief 按助手类型充实上下文。全部只读且尽力而为：数据源缺失时对应键留空，不使请求失败。
     */
    pub fn prepare_context(
        &self,
        conn: &Connection,
        base: &Map<String, Value>,
        role: Role,
    ) -> Map<String, Value> {
        let mut ctx = base.clone();
        match self {
            AssistantKind::OrderDesk => {
                let order_id = base.get("order_id").and_then(|v| {
                    v.as_i64()
                        .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                });
                if let Some(id) = order_id {
                    if let Ok(Some(order)) = db::get_order_by_id(conn, id) {
                        ctx.insert(
                            "order".to_string(),
                            json!({
                                "title": order.title,
                                "customer": order.customer,
                                "status": order.status,
                                "quantity": order.quantity,
                            }),
                        );
                    }
                }
            }
            AssistantKind::PrintStats => {
                if let Ok(counts) = db::count_orders_by_status(conn) {
                    let total: i64 = counts.iter().map(|(_, n)| n).sum();
                    let mut stats = Map::new();
                    for (status, n) in counts {
                        stats.insert(status, json!(n));
                    }
                    ctx.insert("order_stats".to_string(), Value::Object(stats));
                    ctx.insert("total_orders".to_string(), json!(total));
                }
            }
            AssistantKind::CustomerCare => {
                ctx.insert("requester_role".to_string(), json!(role.as_str()));
            }
        }
        ctx
    }

    /**
     * \brief 处理一次请求：角色门 → 上下文充实 → 委托偏好 Provider 生成。
     */
    pub fn process_request<'a>(
        &self,
        conn: &Connection,
        user_text: &'a str,
        base_context: &Map<String, Value>,
        role: Role,
    ) -> impl std::future::Future<Output = Result<Generation, AssistantError>> + Send + 'a {
        // `Connection` is not `Sync`, so all work touching it happens before the
        // returned future; otherwise the future (and the axum handler awaiting
        // it) would not be `Send`.
        let prepared = (|| {
            if !self.can_access(role) {
                return Err(AssistantError::Forbidden(role.as_str()));
            }
            let ctx = self.prepare_context(conn, base_context, role);
            let provider = self.preferred_provider();
            let cfg = ProviderConfig::new(db::get_provider_settings(conn, provider.id())?);
            let opts = GenerateOptions {
                system: Some(self.system_prompt().to_string()),
                ..GenerateOptions::default()
            };
            Ok((provider, cfg, ctx, opts))
        })();
        async move {
            let (provider, cfg, ctx, opts) = prepared?;
            llm::generate(provider, &cfg, user_text, Some(&ctx), &opts)
                .await
                .map_err(Into::into)
        }
    }
}

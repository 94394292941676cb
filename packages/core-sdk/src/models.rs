use serde::{Deserialize, Serialize};

/**
 * \brief 印书订单模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 书名 */
    pub title: String,
    /** \brief 客户名称 */
    pub customer: String,
    /** \brief 订单状态 */
    pub status: String,
    /** \brief 印刷册数 */
    pub quantity: i64,
    /** \brief 备注（机密标记写在这里） */
    pub notes: String,
    /** \brief 创建时间（RFC 3339） */
    pub created_at: String,
}

/**
 * \brief 新建/更新订单的输入结构。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInput {
    pub title: String,
    pub customer: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default)]
    pub notes: String,
}

fn default_status() -> String {
    "pending".to_string()
}

fn default_quantity() -> i64 {
    1
}

/** \brief 订单生命周期的合法状态。 */
pub const ORDER_STATUSES: &[&str] = &[
    "pending",
    "proofing",
    "printing",
    "binding",
    "shipped",
    "cancelled",
];

/**
 * \brief 校验订单状态是否合法。
 */
pub fn is_valid_status(status: &str) -> bool {
    ORDER_STATUSES.contains(&status)
}

/**
 * \brief 请求方角色。
 * \details 未识别的角色一律按 Customer（外部）处理，门禁默认拒绝。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Customer,
    Staff,
    Admin,
}

impl Role {
    /**
     * \brief 按标识符解析角色，未知值归为 Customer。
     */
    pub fn from_id(id: &str) -> Role {
        match id.to_ascii_lowercase().as_str() {
            "staff" => Role::Staff,
            "admin" => Role::Admin,
            _ => Role::Customer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Staff => "staff",
            Role::Admin => "admin",
        }
    }

    /** \brief 是否属于内部角色（staff/admin）。 */
    pub fn is_internal(&self) -> bool {
        matches!(self, Role::Staff | Role::Admin)
    }
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Map};

use inkpress_core_sdk::{assistant, db, firewall, llm, models, server, telemetry};

/**
 * \brief CLI 程序入口：订单管理、AI 助手与机密门禁的命令行面。
 */
#[derive(Parser, Debug)]
#[command(name = "inkpress", version, about = "Inkpress book-printing order service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 写入某个 Provider 的配置。
     */
    Init {
        #[arg(long, default_value = "gpt")]
        provider: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    /**
     * \brief 用已存配置对 Provider 发一次最小探测。
     */
    Validate {
        #[arg(long, default_value = "gpt")]
        provider: String,
    },

    /**
     * \brief 新建一条印书订单。
     */
    NewOrder {
        #[arg(long)]
        title: String,
        #[arg(long)]
        customer: String,
        #[arg(long, default_value_t = 1)]
        quantity: i64,
        #[arg(long, default_value = "pending")]
        status: String,
        #[arg(long, default_value = "")]
        notes: String,
    },

    /**
     * \brief 按角色视角列出订单（门禁过滤后）。
     */
    Orders {
        #[arg(long, default_value = "staff")]
        role: String,
    },

    /**
     * \brief 向某个助手提问。
     */
    Ask {
        #[arg(long)]
        assistant: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "staff")]
        role: String,
        #[arg(long)]
        order_id: Option<i64>,
    },

    /**
     * \brief 机密门禁管理。
     */
    Firewall {
        #[command(subcommand)]
        command: FirewallCommands,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8090")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum FirewallCommands {
    /** \brief 查看当前门禁状态。 */
    Status,
    /** \brief 保存门禁设置（密钥需至少 32 字符，或传空串清除）。 */
    Save {
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long)]
        secret: Option<String>,
    },
    /** \brief 进入封锁。 */
    Lockdown {
        #[arg(long)]
        key: String,
    },
    /** \brief 解除封锁。 */
    Unlock {
        #[arg(long)]
        key: String,
    },
    /** \brief 查看封锁切换审计。 */
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Init {
            provider,
            api_key,
            model,
            enable_telemetry,
        } => {
            let kind = llm::ProviderKind::from_id(&provider)
                .with_context(|| format!("unknown provider: {}", provider))?;
            db::set_provider_setting(&conn, kind.id(), "api_key", &api_key)
                .context("save api key failed")?;
            if let Some(model) = &model {
                db::set_provider_setting(&conn, kind.id(), "model", model)
                    .context("save model failed")?;
            }
            db::set_telemetry_enabled(&conn, enable_telemetry).context("save telemetry failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Saved provider {} (model={})",
                kind.id(),
                model.as_deref().unwrap_or(kind.default_model())
            );
        }
        Commands::Validate { provider } => {
            let kind = llm::ProviderKind::from_id(&provider)
                .with_context(|| format!("unknown provider: {}", provider))?;
            let cfg = llm::ProviderConfig::new(
                db::get_provider_settings(&conn, kind.id()).context("load settings failed")?,
            );
            match llm::validate_credentials(kind, &cfg).await {
                Ok(()) => println!("Credentials for {} look valid", kind.display_name()),
                Err(e) => println!("Credential check failed: {}", e),
            }
        }
        Commands::NewOrder {
            title,
            customer,
            quantity,
            status,
            notes,
        } => {
            if !models::is_valid_status(&status) {
                anyhow::bail!("unknown order status: {}", status);
            }
            let id = db::insert_order(
                &conn,
                &models::OrderInput {
                    title: title.clone(),
                    customer,
                    status,
                    quantity,
                    notes,
                },
            )
            .context("insert order failed")?;
            println!("Created order id={} ({})", id, title);
        }
        Commands::Orders { role } => {
            let role = models::Role::from_id(&role);
            let settings =
                firewall::FirewallSettings::load(&conn).context("load firewall settings failed")?;
            let all = db::list_orders(&conn).context("list orders failed")?;
            let visible = firewall::filter_for_display(&settings, all, role);
            if visible.is_empty() {
                println!("No orders visible for role {}", role.as_str());
            }
            for order in visible {
                println!(
                    "#{} [{}] {} x{} — {}",
                    order.id, order.status, order.title, order.quantity, order.customer
                );
            }
        }
        Commands::Ask {
            assistant: assistant_id,
            prompt,
            role,
            order_id,
        } => {
            let kind = assistant::AssistantKind::from_id(&assistant_id)
                .with_context(|| format!("unknown assistant: {}", assistant_id))?;
            let role = models::Role::from_id(&role);
            let mut base = Map::new();
            if let Some(id) = order_id {
                base.insert("order_id".to_string(), json!(id));
            }
            telemetry::log_event(
                "cli.ask",
                &format!(
                    "assistant={} role={} prompt_len={}",
                    kind.id(),
                    role.as_str(),
                    prompt.len()
                ),
            );
            let generation = kind.process_request(&conn, &prompt, &base, role).await?;
            println!("{}", generation.text);
            println!(
                "-- model={} tokens={}",
                generation.model, generation.tokens
            );
        }
        Commands::Firewall { command } => match command {
            FirewallCommands::Status => {
                let settings = firewall::FirewallSettings::load(&conn)
                    .context("load firewall settings failed")?;
                println!(
                    "enabled={} lockdown={} secret_set={}",
                    settings.enabled,
                    settings.lockdown,
                    !settings.secret.is_empty()
                );
            }
            FirewallCommands::Save { enabled, secret } => {
                let settings = firewall::save_settings(&conn, enabled, secret.as_deref())?;
                println!(
                    "Saved: enabled={} lockdown={} secret_set={}",
                    settings.enabled,
                    settings.lockdown,
                    !settings.secret.is_empty()
                );
            }
            FirewallCommands::Lockdown { key } => {
                firewall::set_lockdown(&conn, true, &key, "cli")?;
                println!("Lockdown engaged");
            }
            FirewallCommands::Unlock { key } => {
                firewall::set_lockdown(&conn, false, &key, "cli")?;
                println!("Lockdown lifted");
            }
            FirewallCommands::Audit => {
                let entries = db::list_audit(&conn, 50).context("list audit failed")?;
                for e in entries {
                    println!(
                        "{} {} {} {} ({})",
                        e.created_at, e.actor, e.action, e.outcome, e.reason
                    );
                }
            }
        },
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
    }

    Ok(())
}

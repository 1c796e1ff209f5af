use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::sync::Arc;

use storyloom_core_sdk::{
    db::SqliteSettingsStore,
    error::GenerationError,
    generation::GenerationService,
    models::{Message, ProviderKind},
    providers::ProviderRegistry,
    server,
    stream::consume_sse,
    telemetry,
};

/**
 * \brief CLI 程序入口：设置管理、模型发现与流式生成。
 */
#[derive(Parser, Debug)]
#[command(name = "storyloom", version, about = "StoryLoom generation core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /** \brief 开启遥测日志。 */
    #[arg(long, global = true, default_value_t = false)]
    telemetry: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 保存某个 Provider 的 API Key 并立即刷新其模型目录。
     */
    SetKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        key: String,
    },

    /**
     * \brief 更新本地推理服务地址。
     */
    SetLocalUrl {
        #[arg(long)]
        url: String,
    },

    /**
     * \brief 列出模型目录，可选强制重新发现。
     */
    Models {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },

    /**
     * \brief 发送一段上下文并流式打印生成结果；Ctrl-C 取消。
     */
    Generate {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

fn parse_provider(value: &str) -> Result<ProviderKind> {
    ProviderKind::parse(value).ok_or_else(|| anyhow!("unknown provider type: {}", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::set_enabled(cli.telemetry);

    let store = SqliteSettingsStore::open_default().context("open settings store failed")?;
    let service = Arc::new(GenerationService::new(
        Arc::new(store),
        ProviderRegistry::new(),
    ));
    service.initialize().await.context("initialize service failed")?;

    match cli.command {
        Commands::SetKey { provider, key } => {
            let kind = parse_provider(&provider)?;
            service
                .update_key(kind, &key)
                .await
                .context("save key failed")?;
            println!("Saved {} key and refreshed its model catalog", kind);
        }
        Commands::SetLocalUrl { url } => {
            service
                .update_local_api_url(&url)
                .await
                .context("save local url failed")?;
            println!("Local API url -> {}", url);
        }
        Commands::Models { provider, refresh } => {
            let kind = provider.as_deref().map(parse_provider).transpose()?;
            let models = service
                .get_available_models(kind, refresh)
                .await
                .context("load models failed")?;
            if models.is_empty() {
                println!("(no models discovered)");
            }
            for model in models {
                println!(
                    "{:<12} {:<40} ctx={}",
                    model.provider, model.id, model.context_length
                );
            }
        }
        Commands::Generate {
            provider,
            model,
            prompt,
            system,
            temperature,
            max_tokens,
        } => {
            let kind = parse_provider(&provider)?;
            let mut messages = Vec::new();
            if let Some(system) = system {
                messages.push(Message {
                    role: "system".to_string(),
                    content: system,
                });
            }
            messages.push(Message {
                role: "user".to_string(),
                content: prompt,
            });

            // Ctrl-C 只取消当前追踪的生成
            let aborter = service.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    aborter.abort_stream();
                }
            });

            let response = service
                .generate(kind, &messages, &model, temperature, max_tokens)
                .await
                .context("generate failed")?;

            if response.status().as_u16() == 204 {
                println!("(cancelled)");
                return Ok(());
            }

            if kind == ProviderKind::Local {
                // 本地流未封帧，字节直接就是文本
                let mut stream = response.into_body().into_data_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.context("stream error")?;
                    print!("{}", String::from_utf8_lossy(&chunk));
                    use std::io::Write;
                    std::io::stdout().flush().ok();
                }
                println!();
            } else {
                let chunks = response
                    .into_body()
                    .into_data_stream()
                    .map(|item| item.map_err(GenerationError::transport));
                consume_sse(
                    Box::pin(chunks),
                    |token| {
                        print!("{}", token);
                        use std::io::Write;
                        std::io::stdout().flush().ok();
                    },
                    || println!(),
                    |err| eprintln!("stream error: {}", err),
                )
                .await;
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr, service.clone()).await?;
        }
    }

    Ok(())
}

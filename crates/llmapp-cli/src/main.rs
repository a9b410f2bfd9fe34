//! llmapp CLI - demo UI and model publishing for database-resident LLM inference

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use warp::Filter;

use llmapp_core::error::error_chain;
use llmapp_core::{InferenceRequest, Task};

use llmapp_cli::api::{self, AppState};
use llmapp_cli::config::Config;
use llmapp_cli::services;
use llmapp_cli::workflow::{PublishArgs, PublishWorkflow};

#[derive(Parser)]
#[command(name = "llmapp")]
#[command(author = "llmapp Contributors")]
#[command(version = "0.1.0")]
#[command(about = "llmapp - LLM analytics with Postgres and the Hugging Face Hub", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "LLMAPP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo web UI
    Serve {
        /// Bind address (overrides server.bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Publish a pretrained model, promote it to staging and send its metadata
    Publish(PublishArgs),

    /// Run one prompt through the inference function
    Ask {
        /// Prompt text
        prompt: String,

        /// Model to use (defaults to the selected champion model)
        #[arg(short, long)]
        model: Option<String>,

        /// Task passed to the inference function
        #[arg(short, long, default_value = "summarization")]
        task: String,

        /// Tracking experiment for the prompt
        #[arg(short, long)]
        experiment: Option<String>,

        /// Use every document instead of the top-k matches
        #[arg(long)]
        no_topk: bool,
    },

    /// Print the model the question bot would use
    SelectModel,

    /// Generate example configuration file
    ConfigGen {
        /// Output format (yaml, toml)
        #[arg(short, long, default_value = "yaml")]
        format: String,

        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    llmapp_cli::init_logging(&config.logging)?;

    match cli.command {
        Commands::Serve { bind, port } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let port = port.unwrap_or(config.server.port);
            let ip: IpAddr = bind
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid bind address '{}': {}", bind, e))?;
            serve(&config, SocketAddr::new(ip, port)).await?;
        }

        Commands::Publish(args) => {
            let workflow = PublishWorkflow::from_config(&config)?;
            let report = workflow.run(&args).await?;
            println!(
                "Published {} as {} version {} (alias {})",
                report.publish.repo_name,
                report.promotion.staging_name,
                report.promotion.staging_version,
                report.promotion.alias
            );
        }

        Commands::Ask {
            prompt,
            model,
            task,
            experiment,
            no_topk,
        } => {
            let gateway = services::inference_gateway(&config)?;
            let model = match model {
                Some(model) => model,
                None => services::model_selector(&config)?.select_base_llm().await,
            };
            let mut request = InferenceRequest::new(prompt, Task::from(task), model)
                .with_topk(!no_topk)
                .with_inference_function(&config.database.inference_function);
            if let Some(experiment) = experiment {
                request = request.with_experiment(experiment);
            }

            let result = gateway
                .run_task(&request)
                .await
                .map_err(|e| anyhow::anyhow!("{}", error_chain(&e)))?;
            println!("{}", result.answer);
            if let Some(url) = result.doc_url {
                println!("Source: {}", url);
            }
        }

        Commands::SelectModel => {
            let selector = services::model_selector(&config)?;
            println!("{}", selector.select_base_llm().await);
        }

        Commands::ConfigGen { format, output } => {
            let content = match format.to_lowercase().as_str() {
                "yaml" | "yml" => Config::example_yaml(),
                "toml" => Config::example_toml(),
                _ => anyhow::bail!("Unsupported format: {}. Use 'yaml' or 'toml'", format),
            };

            if let Some(path) = output {
                std::fs::write(&path, &content)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", content);
            }
        }
    }

    Ok(())
}

async fn serve(config: &Config, addr: SocketAddr) -> Result<()> {
    let state = Arc::new(AppState::new(
        services::inference_gateway(config)?,
        services::model_selector(config)?,
        config.ui.clone(),
        config.database.inference_function.clone(),
        &config.dedup,
    ));

    let routes = api::ui_routes(state).with(warp::trace::request());

    let (bound, server) = warp::serve(routes).try_bind_with_graceful_shutdown(addr, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })?;
    info!("Serving UI on http://{}", bound);
    server.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from(["llmapp", "serve", "--port", "9000"]).unwrap();
        match cli.command {
            Commands::Serve { bind, port } => {
                assert_eq!(bind, None);
                assert_eq!(port, Some(9000));
            }
            _ => panic!("expected serve"),
        }

        let cli = Cli::try_parse_from(["llmapp", "-c", "llmapp.yaml", "serve", "--bind", "127.0.0.1"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("llmapp.yaml")));
        assert!(matches!(cli.command, Commands::Serve { bind: Some(_), port: None }));
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "llmapp",
            "publish",
            "tanzuhuggingface/dev",
            "google/flan-t5-base",
            "huggingface",
            "DEV",
            "http://datahub-gms:8080",
            "Summarizer",
            "summarization",
            "yes",
        ])
        .unwrap();
        match cli.command {
            Commands::Publish(args) => {
                assert_eq!(args.model_name, "tanzuhuggingface/dev");
                assert_eq!(args.pipeline_name, "summarization");
                assert!(args.persist);
            }
            _ => panic!("expected publish"),
        }

        let missing_persist = Cli::try_parse_from([
            "llmapp", "publish", "a/b", "c/d", "hf", "DEV", "http://gms", "desc", "summarization",
        ]);
        assert!(missing_persist.is_err());
    }

    #[test]
    fn test_parse_ask() {
        let cli = Cli::try_parse_from(["llmapp", "ask", "What is Tanzu?", "-t", "question", "--no-topk"]).unwrap();
        match cli.command {
            Commands::Ask {
                prompt,
                model,
                task,
                experiment,
                no_topk,
            } => {
                assert_eq!(prompt, "What is Tanzu?");
                assert_eq!(model, None);
                assert_eq!(task, "question");
                assert_eq!(experiment, None);
                assert!(no_topk);
            }
            _ => panic!("expected ask"),
        }
    }
}

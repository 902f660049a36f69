use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;

use webpilot::config::Config;
use webpilot::engine::{EngineConfig, ExecutionEngine, FinishedTask};
use webpilot::executor::ChromeExecutor;
use webpilot::monitor::console_observer;
use webpilot::planner::OpenRouterPlanner;
use webpilot::serve;

/// AI-planned browser automation with self-healing retries.
#[derive(Parser)]
#[command(name = "webpilot", version)]
struct Cli {
    /// Execute a single task and exit
    #[arg(long)]
    task: Option<String>,

    /// Serve the web dashboard instead of the terminal prompt
    #[arg(long)]
    serve: bool,

    /// Run Chrome headless
    #[arg(long)]
    headless: bool,

    /// Override the replan budget from the environment
    #[arg(long)]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "webpilot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if cli.headless {
        config.headless = true;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    let planner = OpenRouterPlanner::new(&config.api_key, &config.model);

    tracing::info!("starting browser session");
    let headless = config.headless;
    let screenshot_dir = config.screenshot_dir.clone();
    let mut executor =
        tokio::task::spawn_blocking(move || ChromeExecutor::launch(headless, screenshot_dir))
            .await
            .map_err(|e| anyhow::anyhow!("browser launch panicked: {e}"))??;

    if cli.serve {
        serve_loop(&planner, &mut executor, &config).await
    } else if let Some(task) = cli.task {
        let finished = run_task(&planner, &mut executor, &config, &task, true).await?;
        if !finished.succeeded() {
            std::process::exit(1);
        }
        Ok(())
    } else {
        interactive_loop(&planner, &mut executor, &config).await
    }
}

/// Read tasks from the terminal until EOF or an exit word.
async fn interactive_loop(
    planner: &OpenRouterPlanner,
    executor: &mut ChromeExecutor,
    config: &Config,
) -> Result<()> {
    use std::io::Write;

    println!("Type a browser task in natural language; 'quit' to exit.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\ntask> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let task = line.trim();
        if task.is_empty() {
            continue;
        }
        if matches!(task, "quit" | "exit" | "q") {
            break;
        }
        run_task(planner, executor, config, task, false).await?;
    }
    Ok(())
}

/// Accept tasks from the web dashboard, one at a time.
async fn serve_loop(
    planner: &OpenRouterPlanner,
    executor: &mut ChromeExecutor,
    config: &Config,
) -> Result<()> {
    let (mut cmd_rx, event_tx, status_slot) = serve::start_server().await?;

    while let Some(command) = cmd_rx.recv().await {
        let mut engine = ExecutionEngine::new(planner, &mut *executor).with_config(EngineConfig {
            step_timeout: config.step_timeout,
        });
        engine.subscribe(console_observer());
        engine.subscribe(serve::broadcast_observer(event_tx.clone()));

        let finished = engine.run(&command, config.max_retries).await;
        if let Ok(mut slot) = status_slot.write() {
            *slot = Some(finished.status());
        }
        persist_log(&finished, config);
    }
    Ok(())
}

/// Run one task with console output; optionally wire Ctrl-C cancellation.
async fn run_task(
    planner: &OpenRouterPlanner,
    executor: &mut ChromeExecutor,
    config: &Config,
    prompt: &str,
    cancellable: bool,
) -> Result<FinishedTask> {
    let mut engine = ExecutionEngine::new(planner, &mut *executor).with_config(EngineConfig {
        step_timeout: config.step_timeout,
    });
    engine.subscribe(console_observer());

    if cancellable {
        let cancel = CancellationToken::new();
        engine = engine.with_cancel_token(cancel.clone());
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let finished = engine.run(prompt, config.max_retries).await;
    print_summary(&finished);
    persist_log(&finished, config);
    Ok(finished)
}

fn print_summary(finished: &FinishedTask) {
    let status = finished.status();
    println!(
        "\nsummary: {}/{} steps completed, {} failed",
        status.completed, status.total_steps, status.failed
    );
    if !status.urls_visited.is_empty() {
        println!("visited: {}", status.urls_visited.join(", "));
    }
    match &finished.outcome {
        Ok(()) => println!("task completed"),
        Err(error) => println!("task failed: {error}"),
    }
}

fn persist_log(finished: &FinishedTask, config: &Config) {
    if !config.save_logs {
        return;
    }
    let path = config.log_dir.join(format!(
        "execution_{}.json",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ));
    match finished.monitor.save_log(&path) {
        Ok(()) => println!("log saved to {}", path.display()),
        Err(error) => tracing::warn!("could not save log: {error:#}"),
    }
}

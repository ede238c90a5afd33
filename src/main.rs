//! gauntlet CLI
//!
//! Exit codes: `test` returns 0 when the target held up, 1 when it is
//! vulnerable, 2 on error; every other command returns 0 on success and 2
//! on error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::error;

use gauntlet::audit::{
    run_security_test, run_stress_test, SecurityTestConfig, StressTestConfig,
};
use gauntlet::driver::HttpLauncher;
use gauntlet::proxy::{format_proxy_line, load_proxy_list, probe_proxy};
use gauntlet::queue::{Action, Extractor, Task};
use gauntlet::{AppConfig, Runtime};

#[derive(Parser)]
#[command(name = "gauntlet", version, about = "Bot-detection resilience testing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assess a target's bot defenses and write a vulnerability report
    Test {
        url: String,
        /// Attempts to run, one fresh session each
        #[arg(short, long, default_value_t = 5)]
        attempts: usize,
        /// Route sessions through the proxy pool
        #[arg(short = 'p', long)]
        use_proxies: bool,
        /// Add human-like scrolling and pauses
        #[arg(short = 'b', long)]
        human_behavior: bool,
        /// Report output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Hammer one URL with parallel sessions
    Stress {
        url: String,
        /// Parallel sessions
        #[arg(short, long, default_value_t = 5)]
        concurrent: usize,
        /// Requests per session
        #[arg(short, long, default_value_t = 10)]
        requests: usize,
        #[arg(short = 'p', long)]
        use_proxies: bool,
    },
    /// Fetch one page through the full pipeline
    Scrape {
        url: String,
        /// CSS selector to extract
        #[arg(short, long)]
        selector: Option<String>,
        /// Write extracted data to this file instead of stdout
        #[arg(short, long)]
        output_file: Option<PathBuf>,
        #[arg(short = 'p', long)]
        use_proxies: bool,
        #[arg(short = 'b', long)]
        human_behavior: bool,
    },
    /// Inspect and test the configured proxy list
    Proxy {
        /// Proxy list file (overrides configuration)
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Probe each proxy's connectivity
        #[arg(short, long)]
        test: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };
    let _log_guard = gauntlet::init_logging(&config);

    match run(cli, &mut config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli, config: &mut AppConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Test {
            url,
            attempts,
            use_proxies,
            human_behavior,
            output_dir,
        } => {
            config.proxy_enabled = config.proxy_enabled || use_proxies;
            let runtime = Runtime::new(config.clone(), Arc::new(HttpLauncher::new()))?;

            let test_config = SecurityTestConfig {
                url,
                attempts,
                use_proxies,
                human_behavior,
                output_dir: output_dir.or_else(|| config.report_dir.clone()),
            };
            let report = run_security_test(
                &runtime.sessions,
                &runtime.limiter,
                &runtime.aggregator,
                &test_config,
            )
            .await?;
            runtime.shutdown().await;

            let verdict = if report.vulnerable() {
                "VULNERABLE"
            } else {
                "PROTECTED"
            };
            println!(
                "{verdict}: {} (bypass {}, detection rate {:.0}%, {} finding(s))",
                report.url,
                report.bypass_success,
                report.detection_rate * 100.0,
                report.vulnerabilities.len()
            );
            Ok(ExitCode::from(if report.vulnerable() { 1 } else { 0 }))
        }

        Commands::Stress {
            url,
            concurrent,
            requests,
            use_proxies,
        } => {
            config.proxy_enabled = config.proxy_enabled || use_proxies;
            config.max_concurrent_browsers = config.max_concurrent_browsers.max(concurrent);
            let runtime = Runtime::new(config.clone(), Arc::new(HttpLauncher::new()))?;

            let stress_config = StressTestConfig {
                url,
                concurrent_sessions: concurrent,
                requests_per_session: requests,
                use_proxies,
            };
            let report = run_stress_test(
                &runtime.sessions,
                &runtime.limiter,
                &runtime.aggregator,
                &runtime.metrics,
                &stress_config,
            )
            .await?;
            runtime.shutdown().await;

            println!(
                "stress: {}/{} ok, {} detections, avg {:.1}ms over {}ms wall clock",
                report.successful,
                report.total_requests,
                report.detections,
                report.avg_response_time_ms,
                report.wall_clock_ms
            );
            Ok(ExitCode::from(0))
        }

        Commands::Scrape {
            url,
            selector,
            output_file,
            use_proxies,
            human_behavior,
        } => {
            config.proxy_enabled = config.proxy_enabled || use_proxies;
            let runtime = Runtime::new(config.clone(), Arc::new(HttpLauncher::new()))?;
            runtime.workers.start().await;

            let mut task = Task::new(url);
            if human_behavior {
                task = task.with_actions(vec![
                    Action::Scroll { delta_y: 600 },
                    Action::Wait { ms: 400 },
                ]);
            }
            if let Some(selector) = selector {
                task = task.with_extractors(vec![Extractor {
                    name: "selection".into(),
                    selector,
                    attribute: None,
                }]);
            }
            let result = runtime.run_task(task).await?;
            runtime.shutdown().await;

            if result.failed {
                eprintln!(
                    "scrape failed: {}",
                    result.reason.as_deref().unwrap_or("unknown")
                );
                return Ok(ExitCode::from(2));
            }

            let rendered = serde_json::to_string_pretty(&result.data)?;
            match output_file {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    println!("scrape ok: data written to {}", path.display());
                }
                None => println!("{rendered}"),
            }
            Ok(ExitCode::from(0))
        }

        Commands::Proxy { file, test } => {
            let path = file
                .or_else(|| config.proxy_list_file.clone())
                .ok_or("no proxy list file configured (use -f or PROXY_LIST_FILE)")?;
            let proxies = load_proxy_list(&path)?;
            println!("{} proxies loaded from {}", proxies.len(), path.display());

            if test {
                let mut working = 0usize;
                for proxy in &proxies {
                    let result = probe_proxy(proxy, Duration::from_secs(15)).await;
                    let status = if result.working {
                        working += 1;
                        format!("ok ({} ms)", result.probe_time_ms)
                    } else {
                        format!("failed: {}", result.error.as_deref().unwrap_or("unknown"))
                    };
                    println!("  {}: {}", format_proxy_line(proxy), status);
                }
                println!("{working}/{} proxies working", proxies.len());
            }
            Ok(ExitCode::from(0))
        }
    }
}

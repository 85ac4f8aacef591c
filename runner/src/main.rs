use clap::{Parser, Subcommand};
use runner::{
    Ecosystem, ExecutionConfig, RunnerError, TestErrorAnalyzer, TestRunner, TestSpecification,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

#[derive(Parser)]
#[command(name = "testforge")]
#[command(about = "Run generated tests under bounded, isolated conditions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a generated test against a project
    Run {
        /// Path to the target project
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// File holding the generated test source
        #[arg(short, long)]
        test_file: PathBuf,
        /// Human-readable test name (defaults to the file stem)
        #[arg(short, long)]
        name: Option<String>,
        /// Ecosystem (django, flask, node); detected when omitted
        #[arg(short, long)]
        ecosystem: Option<Ecosystem>,
        /// Run locally instead of in the container sandbox
        #[arg(long)]
        no_sandbox: bool,
        /// Wall-clock timeout per attempt, seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
        /// Retry budget
        #[arg(long, default_value = "3")]
        retries: u32,
        /// Sandbox memory ceiling
        #[arg(long, default_value = "512m")]
        memory: String,
        /// Sandbox CPU share
        #[arg(long, default_value = "1.0")]
        cpus: f64,
        /// Allow network access inside the sandbox
        #[arg(long)]
        network: bool,
        /// Override the sandbox base image
        #[arg(long)]
        image: Option<String>,
        /// Django settings module (detected from manage.py when omitted)
        #[arg(long)]
        settings: Option<String>,
        /// Collect a coverage total (pytest ecosystems only)
        #[arg(long)]
        coverage: bool,
        /// Emit the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether the container sandbox is usable
    Doctor {
        /// Path to the target project
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
        /// Ecosystem to check the sandbox image for
        #[arg(short, long)]
        ecosystem: Option<Ecosystem>,
    },
    /// Classify a captured failure without executing anything
    Classify {
        /// File holding the generated test source
        #[arg(short, long)]
        test_file: PathBuf,
        /// File holding the captured failure output
        #[arg(short, long)]
        failure_file: PathBuf,
        /// Ecosystem the test targets
        #[arg(short, long, default_value = "flask")]
        ecosystem: Ecosystem,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            path,
            test_file,
            name,
            ecosystem,
            no_sandbox,
            timeout,
            retries,
            memory,
            cpus,
            network,
            image,
            settings,
            coverage,
            json,
        } => {
            let source = std::fs::read_to_string(&test_file)?;
            let name = name.unwrap_or_else(|| {
                test_file
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "generated_test".to_string())
            });
            let ecosystem = match ecosystem.or_else(|| Ecosystem::detect(&path)) {
                Some(ecosystem) => ecosystem,
                None => {
                    error!("could not determine the project ecosystem; pass --ecosystem");
                    std::process::exit(2);
                }
            };

            let spec = TestSpecification::new(name, source, ecosystem);
            let mut config = ExecutionConfig::new()
                .with_memory_limit(memory)
                .with_cpu_limit(cpus)
                .with_timeout(Duration::from_secs(timeout))
                .with_retries(retries)
                .with_network(network)
                .with_sandbox(!no_sandbox)
                .with_coverage(coverage);
            if let Some(image) = image {
                config = config.with_sandbox_image(image);
            }
            if let Some(settings) = settings {
                config = config.with_settings_module(settings);
            }

            let result = TestRunner::new(&path).run(&spec, &config).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }

            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Doctor { path, ecosystem } => {
            doctor(&path, ecosystem).await?;
        }
        Commands::Classify {
            test_file,
            failure_file,
            ecosystem,
        } => {
            let source = std::fs::read_to_string(&test_file)?;
            let failure = std::fs::read_to_string(&failure_file)?;
            let name = test_file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "captured_test".to_string());

            let spec = TestSpecification::new(name, source, ecosystem);
            let analysis = TestErrorAnalyzer::new().classify(&spec, &failure);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
    }

    Ok(())
}

fn print_result(result: &runner::TestResult) {
    if result.success {
        println!(
            "✓ PASSED ({:.2}s, {} mode, {} attempt{})",
            result.duration.as_secs_f64(),
            result.mode,
            result.attempts,
            if result.attempts == 1 { "" } else { "s" }
        );
    } else {
        println!(
            "✗ FAILED ({:.2}s, {} mode, {} attempt{})",
            result.duration.as_secs_f64(),
            result.mode,
            result.attempts,
            if result.attempts == 1 { "" } else { "s" }
        );
    }

    if let Some(coverage) = result.coverage {
        println!("  coverage: {:.0}%", coverage);
    }

    if let Some(analysis) = &result.analysis {
        println!("  kind: {} (confidence {:.2})", analysis.kind, analysis.confidence);
        println!("  {}", analysis.message);
        if let Some(location) = &analysis.location {
            println!("  at {}:{}", location.file, location.line);
        }
        if let Some(fix) = &analysis.suggested_fix {
            println!("  fix: {}", fix);
        }
    }

    if !result.output.is_empty() {
        println!("\n--- Output ---\n{}", result.output);
    }
}

async fn doctor(path: &std::path::Path, ecosystem: Option<Ecosystem>) -> Result<(), RunnerError> {
    use runner::ContainerSandboxBackend;

    println!("Checking container sandbox...");

    let runtime = sandbox::detect_runtime().await;
    if !runtime.is_available() {
        println!("✗ No container runtime found. Install Podman or Docker.");
        return Ok(());
    }
    println!("✓ Container runtime: {}", runtime);

    let ecosystem = ecosystem
        .or_else(|| Ecosystem::detect(path))
        .unwrap_or(Ecosystem::Flask);
    let config = ExecutionConfig::default();

    match ContainerSandboxBackend::connect(path, ecosystem, &config).await {
        Ok(backend) => {
            let (ok, diagnostics) = backend.validate().await;
            if ok {
                println!("✓ Sandbox ready for {} tests.", ecosystem);
            } else {
                println!("✗ Sandbox unavailable:\n{}", diagnostics);
                println!("  Runs will fall back to local execution.");
            }
        }
        Err(e) => {
            println!("✗ Sandbox unavailable: {}", e);
            println!("  Runs will fall back to local execution.");
        }
    }

    Ok(())
}

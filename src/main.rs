//! Learnloop - self-improving prompt feedback loop CLI.

use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::ProgressBar;
use std::collections::HashMap;
use std::path::PathBuf;

use learnloop::fix::{ReviewReport, Severity};
use learnloop::learning::{LearningLoop, RecordRequest};
use learnloop::{LoopConfig, LoopError};

#[derive(Parser)]
#[command(name = "learnloop")]
#[command(version = "0.1.0")]
#[command(about = "Self-improving prompt feedback loop with verified code fixes", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an interaction outcome for a prompt
    Record {
        /// Prompt identifier
        #[arg(long)]
        prompt_id: String,

        /// The query the prompt was applied to
        #[arg(long)]
        query: String,

        /// Mark the interaction as failed (default: success)
        #[arg(long)]
        failed: bool,

        /// Named metrics as a JSON object
        #[arg(long, default_value = "{}")]
        metrics: String,

        /// Response text
        #[arg(long, default_value = "")]
        response: String,

        /// Free-text feedback
        #[arg(long)]
        feedback: Option<String>,
    },

    /// Analyze a prompt's performance and refine it if warranted
    Analyze {
        /// Prompt identifier
        prompt_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the improvement cycle over every prompt in the store
    ImproveAll,

    /// Show combined efficacy statistics for prompts and code fixes
    EfficacyStats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply code fixes from a review findings file
    ApplyFixes {
        /// JSON file with review findings
        findings_file: PathBuf,

        /// Preview fixes without applying
        #[arg(long)]
        dry_run: bool,

        /// Severity levels to fix (default: critical, high)
        #[arg(long = "severity", value_enum)]
        severities: Vec<Severity>,
    },

    /// Show global interaction statistics
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "learnloop=debug,info"
    } else {
        "learnloop=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> learnloop::Result<()> {
    let project_path = cli.project.canonicalize().unwrap_or(cli.project.clone());
    if !project_path.exists() {
        return Err(LoopError::config(format!(
            "project directory does not exist: {}",
            project_path.display()
        )));
    }

    let config = LoopConfig::load(&project_path)?;
    let learning = LearningLoop::new(&project_path, config)?;

    match cli.command {
        Commands::Record {
            prompt_id,
            query,
            failed,
            metrics,
            response,
            feedback,
        } => {
            let metrics: HashMap<String, serde_json::Value> = serde_json::from_str(&metrics)?;

            let mut request =
                RecordRequest::new(&prompt_id, query, !failed).with_metrics(metrics);
            request.response = response;
            request.feedback = feedback;

            let outcome = learning.record_interaction(request)?;
            println!(
                "{} Recorded interaction #{} for {}",
                "OK".green().bold(),
                outcome.interaction_count,
                prompt_id
            );
            if let Some(refined) = outcome.refined {
                println!(
                    "   {} Prompt refined to version {}",
                    "Refined:".cyan().bold(),
                    refined.version
                );
            }
        }

        Commands::Analyze { prompt_id, json } => {
            // The prompt must exist for analysis to be actionable.
            learning.store().require(&prompt_id)?;
            let analysis = learning.analyze(&prompt_id)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&analysis)?);
            } else {
                println!("\n{} {}", "Analyzing prompt:".cyan().bold(), prompt_id);
                println!("  Total interactions: {}", analysis.total_interactions);
                println!("  Success rate: {:.1}%", analysis.success_rate * 100.0);
                if !analysis.average_metrics.is_empty() {
                    let mut metrics: Vec<_> = analysis.average_metrics.iter().collect();
                    metrics.sort_by(|a, b| a.0.cmp(b.0));
                    println!("  Average metrics:");
                    for (name, value) in metrics {
                        println!("    {name}: {value:.2}");
                    }
                }
                for opportunity in &analysis.improvement_opportunities {
                    println!("  {} {}", "Flag:".yellow(), opportunity);
                }
            }

            match learning.analyze_and_improve(&prompt_id)? {
                Some(improved) => println!(
                    "\n{} Prompt improved! New version: {}",
                    "OK".green().bold(),
                    improved.version
                ),
                None => println!("\n{} No refinement needed", "OK".green().bold()),
            }
        }

        Commands::ImproveAll => {
            let prompt_ids = learning.prompt_ids()?;
            let bar = ProgressBar::new(prompt_ids.len() as u64);

            let mut refined = 0usize;
            let mut errors: Vec<(String, String)> = Vec::new();
            for prompt_id in &prompt_ids {
                match learning.analyze_and_improve(prompt_id) {
                    Ok(Some(_)) => refined += 1,
                    Ok(None) => {}
                    Err(e) => errors.push((prompt_id.clone(), e.to_string())),
                }
                bar.inc(1);
            }
            bar.finish_and_clear();

            println!(
                "{} Improvement cycle complete: {} examined, {} refined",
                "OK".green().bold(),
                prompt_ids.len(),
                refined
            );
            for (prompt_id, error) in errors {
                println!("   {} {}: {}", "Warning:".yellow(), prompt_id, error);
            }
        }

        Commands::EfficacyStats { json } => {
            let report = learning.efficacy_report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.render());
            }
        }

        Commands::ApplyFixes {
            findings_file,
            dry_run,
            severities,
        } => {
            if !findings_file.exists() {
                return Err(LoopError::FindingsNotFound {
                    path: findings_file,
                });
            }
            let content = std::fs::read_to_string(&findings_file)?;
            let report: ReviewReport = serde_json::from_str(&content)?;

            let filter = if severities.is_empty() {
                None
            } else {
                Some(severities.as_slice())
            };
            let results = learning.apply_fixes(&report, filter, dry_run).await?;

            let mode = if dry_run { " (dry run)" } else { "" };
            println!("\nApplied {} fixes{}", results.len(), mode);
            for result in &results {
                let status = if result.success {
                    "OK".green().bold()
                } else {
                    "FAILED".red().bold()
                };
                println!("  [{}] {}", status, result.fix_id);
                if let Some(ref error) = result.error_message {
                    println!("       {error}");
                }
                if result.rollback_needed {
                    println!(
                        "       {} Rolled back due to build/test failure",
                        "Warning:".yellow()
                    );
                }
            }
        }

        Commands::Stats { json } => {
            let stats = learning.ledger().statistics()?;
            let top = learning.ledger().top_prompts(5)?;
            let low = learning.ledger().low_performing(0.7)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "global": stats,
                        "top_prompts": top,
                        "low_performing": low,
                    }))?
                );
            } else {
                println!("\n{}", "Interaction Statistics".cyan().bold());
                println!("{}", "─".repeat(60));
                println!("  Total interactions: {}", stats.total_interactions);
                println!("  Unique prompts: {}", stats.total_prompts);
                println!("  Success rate: {:.1}%", stats.avg_success_rate * 100.0);

                if !top.is_empty() {
                    println!("\n  Most used prompts:");
                    for usage in &top {
                        println!(
                            "    {} ({} interactions, {:.1}% success)",
                            usage.prompt_id,
                            usage.count,
                            usage.success_rate * 100.0
                        );
                    }
                }
                if !low.is_empty() {
                    println!("\n  {} Low performing prompts:", "Warning:".yellow());
                    for usage in &low {
                        println!(
                            "    {} ({:.1}% success over {} interactions)",
                            usage.prompt_id,
                            usage.success_rate * 100.0,
                            usage.count
                        );
                    }
                }
            }
        }
    }

    Ok(())
}

//! Command execution.

use crate::config::Config;
use crate::Commands;
use colored::Colorize;
use mwrpc_client::{CallOutcome, RpcClient};
use mwrpc_protocol::{Event, JobHandle, JobStatus};
use serde_json::{json, Value};
use std::time::Duration;

/// Method answered by a healthy daemon.
const PING_METHOD: &str = "core.ping";

/// Executes a command and returns the formatted output.
pub async fn execute(
    client: &RpcClient,
    config: &Config,
    cmd: Commands,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Ping => {
            let result = client.call_value(PING_METHOD, Value::Null).await?;
            match result.as_str() {
                Some(s) if s.eq_ignore_ascii_case("pong") => Ok("PONG".green().to_string()),
                _ => Ok(format_json(&result)),
            }
        }

        Commands::Call {
            method,
            params,
            wait,
            timeout,
            raw,
        } => {
            let params = params
                .map(|p| parse_json_arg(&p))
                .transpose()?
                .map(positional)
                .unwrap_or_else(|| json!([]));

            let output = |value: &Value| {
                if raw {
                    value.to_string()
                } else {
                    format_json(value)
                }
            };

            match client.call(&method, params).await? {
                CallOutcome::Value(value) => Ok(output(&value)),
                CallOutcome::Job(handle) if wait => {
                    eprintln!("{} job {}", "Waiting for".dimmed(), handle);
                    let max_wait = max_wait(config, timeout);
                    let status = client.await_job(&handle, max_wait).await?;
                    Ok(output(status.result.as_ref().unwrap_or(&Value::Null)))
                }
                CallOutcome::Job(handle) => Ok(format!(
                    "{} job {}",
                    "Started".green(),
                    handle.to_string().cyan()
                )),
            }
        }

        Commands::AwaitJob { id, timeout } => {
            let status = client.await_job(&id, max_wait(config, timeout)).await?;
            Ok(format_job(&id, &status))
        }

        Commands::Job { id } => {
            let statuses = client.query_job(&id).await?;
            match statuses.first() {
                Some(status) => Ok(format_job(&id, status)),
                None => Ok(format!("Job {} not found", id).yellow().to_string()),
            }
        }

        // Watch streams events and is handled directly in main.rs
        Commands::Watch => unreachable!(),
    }
}

fn max_wait(config: &Config, timeout: Option<u64>) -> Duration {
    timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.jobs.max_wait())
}

/// Wraps a non-array value as the single positional parameter.
fn positional(params: Value) -> Value {
    match params {
        Value::Array(_) => params,
        other => json!([other]),
    }
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Formats a job snapshot.
fn format_job(handle: &JobHandle, status: &JobStatus) -> String {
    let state = if status.state.is_failure() {
        status.state.to_string().red()
    } else if status.is_terminal() {
        status.state.to_string().green()
    } else {
        status.state.to_string().yellow()
    };

    let mut output = format!("{}\n  State: {}", format!("Job {}", handle).bold(), state);
    if let Some(ref method) = status.method {
        output.push_str(&format!("\n  Method: {}", method.cyan()));
    }
    if let Some(percent) = status.progress.percent {
        output.push_str(&format!("\n  Progress: {:.0}%", percent));
    }
    if let Some(ref description) = status.progress.description {
        output.push_str(&format!("\n  Description: {}", description));
    }
    if let Some(error) = status.error_message() {
        output.push_str(&format!("\n  Error: {}", error.red()));
    }
    if let Some(ref result) = status.result {
        output.push_str(&format!("\n  Result: {}", format_json(result)));
    }
    output
}

/// Formats a pushed event as one line.
pub fn format_event(event: &Event) -> String {
    let mut line = format!("{} {}", event.kind.as_str().cyan(), event.collection);
    if let Some(ref id) = event.id {
        line.push_str(&format!(" id={}", id));
    }
    if let Some(ref fields) = event.fields {
        line.push(' ');
        line.push_str(&fields.to_string());
    }
    line
}

//! Console front-end: prints [`KernelEvent`]s and answers human requests
//! from stdin.
//!
//! Decision requests accept an option number or free text. Tool
//! confirmations accept `a`/`approve`, `r`/`reject [reason]` or `abort`.

use std::io::BufRead;

use colored::Colorize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use warden_kernel::HumanResponder;
use warden_kernel::human_gate::FEEDBACK;
use warden_runtime::KernelEvent;
use warden_types::TaskStatus;

/// What to send back for one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub decision: String,
    pub text: String,
}

impl Answer {
    fn new(decision: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            decision: decision.into(),
            text: text.into(),
        }
    }
}

/// Map a line typed at a decision prompt. `None` for a blank line.
pub fn decision_answer(line: &str, options: &[String]) -> Option<Answer> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Ok(n) = line.parse::<usize>()
        && (1..=options.len()).contains(&n)
    {
        return Some(Answer::new(options[n - 1].clone(), ""));
    }
    Some(Answer::new(FEEDBACK, line))
}

/// Map a line typed at a tool-confirmation prompt. `None` when the line is
/// not an approval, a rejection or a stop request.
pub fn confirmation_answer(line: &str) -> Option<Answer> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    match word.to_lowercase().as_str() {
        "a" | "approve" | "y" | "yes" => Some(Answer::new("approve", "")),
        "r" | "reject" | "n" | "no" => Some(Answer::new("reject", rest.trim())),
        "abort" | "stop" => Some(Answer::new("abort", "")),
        _ => None,
    }
}

/// One-line (or short multi-line) rendering of `event`.
pub fn render(event: &KernelEvent) -> String {
    match event {
        KernelEvent::StepUpdate { step, title, status, .. } => {
            format!("  {} {} {}", format!("[step {step}]").dimmed(), title, format!("({status})").dimmed())
        }
        KernelEvent::HumanRequired { reason, options, .. } => {
            let mut out = format!("\n  {} {}", "?".yellow().bold(), reason.bold());
            for (i, option) in options.iter().enumerate() {
                out.push_str(&format!("\n    {}) {}", i + 1, option));
            }
            out
        }
        KernelEvent::ToolConfirmRequired {
            call,
            level,
            needs_preview,
            ..
        } => {
            let args = serde_json::to_string_pretty(&call.args).unwrap_or_default();
            let mut out = format!(
                "\n  {} {} {}\n{}",
                "⚠".yellow().bold(),
                call.tool.bold(),
                format!("requires {level} approval").yellow(),
                indent(&args, 4)
            );
            if *needs_preview {
                out.push_str(&format!("\n    {}", "review the content above before approving".dimmed()));
            }
            out
        }
        KernelEvent::Completed { status, .. } => match status {
            TaskStatus::Completed => format!("  {} task {}", "✓".green().bold(), status.to_string().green()),
            other => format!("  {} task {}", "■".red().bold(), other.to_string().red()),
        },
        KernelEvent::Error { message, .. } => format!("  {} {}", "error:".red().bold(), message),
        KernelEvent::Info { message, .. } => format!("  {}", message.dimmed()),
    }
}

fn indent(text: &str, width: usize) -> String {
    let pad = " ".repeat(width);
    text.lines().map(|l| format!("{pad}{l}")).collect::<Vec<_>>().join("\n")
}

/// Forward stdin lines from a plain thread so a pending read never holds up
/// runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn prompt(text: &str) {
    use std::io::Write;
    print!("  {} ", text.cyan());
    std::io::stdout().flush().ok();
}

/// Print events until the bus closes, answering human requests on the way.
pub fn spawn(mut events: broadcast::Receiver<KernelEvent>, responder: HumanResponder) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = stdin_lines();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    println!("  {}", format!("({n} events skipped)").dimmed());
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            println!("{}", render(&event));

            let answer = match &event {
                KernelEvent::HumanRequired { options, .. } => {
                    read_answer(&mut lines, "answer (number or text) >", |l| decision_answer(l, options)).await
                }
                KernelEvent::ToolConfirmRequired { .. } => {
                    read_answer(&mut lines, "[a]pprove / [r]eject [reason] / abort >", confirmation_answer).await
                }
                _ => continue,
            };
            let Some(answer) = answer else { break };
            if let Err(e) = responder.provide_response(answer.decision, answer.text) {
                println!("  {} {}", "could not deliver answer:".red(), e);
            }
        }
    })
}

async fn read_answer(
    lines: &mut mpsc::UnboundedReceiver<String>,
    label: &str,
    parse: impl Fn(&str) -> Option<Answer>,
) -> Option<Answer> {
    loop {
        prompt(label);
        let line = lines.recv().await?;
        if let Some(answer) = parse(&line) {
            return Some(answer);
        }
    }
}

//! Console rendering for `voratiq run`: a bar per agent in TTY mode, falling
//! back to line-at-a-time status text otherwise.

use std::collections::HashMap;
use std::io::IsTerminal;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use voratiq_core::renderer::Renderer;
use voratiq_core::types::{AgentInvocationRecord, AgentStatus, RunReport};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    std::io::stdout().is_terminal()
}

struct Bars {
    multi: MultiProgress,
    by_agent: HashMap<String, ProgressBar>,
}

/// Renders agent progress to the console: one `indicatif` spinner/bar per
/// agent when stdout is a TTY, plain `[agentId] status` lines otherwise.
pub struct ConsoleRenderer {
    is_tty: bool,
    bars: Mutex<Bars>,
}

impl ConsoleRenderer {
    pub fn new() -> Self {
        Self {
            is_tty: is_tty(),
            bars: Mutex::new(Bars {
                multi: MultiProgress::new(),
                by_agent: HashMap::new(),
            }),
        }
    }

    fn bar_for(&self, bars: &mut Bars, agent_id: &str) -> ProgressBar {
        if let Some(existing) = bars.by_agent.get(agent_id) {
            return existing.clone();
        }
        let pb = bars.multi.add(ProgressBar::new_spinner());
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bars.by_agent.insert(agent_id.to_string(), pb.clone());
        pb
    }

    fn status_line(agent: &AgentInvocationRecord) -> String {
        format!("[{}] {}: {:?}", agent.agent_id, agent.model, agent.status)
    }
}

impl Default for ConsoleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for ConsoleRenderer {
    fn update(&self, agent: &AgentInvocationRecord) {
        if self.is_tty {
            let mut bars = self.bars.lock().expect("lock poisoned");
            let pb = self.bar_for(&mut bars, &agent.agent_id);
            pb.set_message(Self::status_line(agent));
            if agent.status.is_terminal() {
                match agent.status {
                    AgentStatus::Succeeded => pb.finish_with_message(Self::status_line(agent)),
                    _ => pb.abandon_with_message(Self::status_line(agent)),
                }
            } else {
                pb.tick();
            }
        } else {
            eprintln!("{}", Self::status_line(agent));
        }
    }

    fn complete(&self, report: &RunReport) {
        if self.is_tty {
            let bars = self.bars.lock().expect("lock poisoned");
            let _ = bars.multi.clear();
        }
        println!("run {}: {:?}", report.run_id, report.status);
        for agent in &report.agents {
            println!("  {}", Self::status_line(agent));
        }
        if report.had_eval_failure {
            println!("one or more evals failed; see per-agent eval results above");
        }
    }
}

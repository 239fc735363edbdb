//! In-memory test doubles: a scripted virt-server speaking the protocol over
//! duplex pipes, and a command runner answering from canned outcomes.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use adt_protocol::server::{Reply, Request, read_request, write_reply};
use adt_protocol::Transport;
use async_trait::async_trait;
use tokio::io::{BufReader, duplex};
use tokio::task::JoinHandle;

use crate::exec::{CommandRunner, ExecOutput, RunOutcome, RunSpec, Stream};

/// Behaviour of a [`FakeVirtServer`].
#[derive(Debug, Clone)]
pub struct FakeVirtConfig {
    pub caps: Vec<String>,
    pub scratch: String,
    pub exec: String,
    /// Content written on `copyup` when the testbed path ends with the key;
    /// other files are copied up empty.
    pub files: Vec<(String, String)>,
}

impl FakeVirtConfig {
    pub fn with_caps(caps: &[&str]) -> Self {
        Self {
            caps: caps.iter().map(|c| c.to_string()).collect(),
            scratch: "/scratch".into(),
            exec: "env".into(),
            files: Vec::new(),
        }
    }

    pub fn file(mut self, suffix: &str, content: &str) -> Self {
        self.files.push((suffix.to_string(), content.to_string()));
        self
    }
}

/// Protocol peer run as a tokio task; dropped servers stop answering.
pub struct FakeVirtServer {
    requests: Arc<Mutex<Vec<Request>>>,
    task: JoinHandle<()>,
}

impl FakeVirtServer {
    /// Start serving and return the client end. Needs a running runtime.
    pub fn spawn(config: FakeVirtConfig) -> (FakeVirtServer, Transport) {
        let (client_w, server_r) = duplex(64 * 1024);
        let (server_w, client_r) = duplex(64 * 1024);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(
            config,
            BufReader::new(server_r),
            server_w,
            requests.clone(),
        ));
        (FakeVirtServer { requests, task }, Transport::new(client_r, client_w))
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.requests().iter().filter(|r| r.verb == verb).count()
    }
}

impl Drop for FakeVirtServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    config: FakeVirtConfig,
    mut reader: BufReader<tokio::io::DuplexStream>,
    mut writer: tokio::io::DuplexStream,
    requests: Arc<Mutex<Vec<Request>>>,
) {
    if write_reply(&mut writer, &Reply::ok()).await.is_err() {
        return;
    }
    let mut reverts = 0;
    while let Ok(Some(request)) = read_request(&mut reader).await {
        requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        let reply = match request.verb.as_str() {
            "open" => Reply::ok_with([config.scratch.clone()]),
            "revert" => {
                reverts += 1;
                Reply::ok_with([format!("{}-{reverts}", config.scratch)])
            }
            "print-execute-command" => Reply::ok_with([config.exec.clone()]),
            "capabilities" => Reply::ok_with(config.caps.clone()),
            "copyup" => copyup(&config, &request.args),
            "copydown" | "reboot" | "close" | "shell" | "auxverb_debug_fail" => Reply::ok(),
            "quit" => return,
            other => Reply::error(format!("unknown verb {other}")),
        };
        if write_reply(&mut writer, &reply).await.is_err() {
            return;
        }
    }
}

fn copyup(config: &FakeVirtConfig, args: &[String]) -> Reply {
    let [src, dst] = args else {
        return Reply::error("copyup takes two arguments");
    };
    let result = match dst.strip_suffix('/') {
        Some(dir) => fs::create_dir_all(dir),
        None => {
            let content = config
                .files
                .iter()
                .find(|(suffix, _)| src.ends_with(suffix.as_str()))
                .map(|(_, content)| content.as_str())
                .unwrap_or("");
            Path::new(dst)
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|()| fs::write(dst, content))
        }
    };
    match result {
        Ok(()) => Reply::ok(),
        Err(err) => Reply::error(format!("copyup to {dst} failed: {err}")),
    }
}

struct Rule {
    pattern: String,
    outcomes: VecDeque<RunOutcome>,
}

/// Answers commands from outcomes registered per substring.
///
/// A call matches the longest registered pattern contained in its
/// space-joined argv. Outcomes for one pattern are used in order, the last
/// one repeating. Unmatched calls exit 0 with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, pattern: &str, outcome: RunOutcome) {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        match rules.iter_mut().find(|r| r.pattern == pattern) {
            Some(rule) => rule.outcomes.push_back(outcome),
            None => rules.push(Rule {
                pattern: pattern.to_string(),
                outcomes: VecDeque::from([outcome]),
            }),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.join(" ").contains(pattern))
            .count()
    }

    fn next_outcome(&self, joined: &str) -> Option<RunOutcome> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let rule = rules
            .iter_mut()
            .filter(|r| joined.contains(r.pattern.as_str()))
            .max_by_key(|r| r.pattern.len())?;
        if rule.outcomes.len() > 1 {
            rule.outcomes.pop_front()
        } else {
            rule.outcomes.front().cloned()
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &RunSpec) -> std::io::Result<RunOutcome> {
        let joined = spec.argv.join(" ");
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(spec.argv.clone());
        let outcome = self
            .next_outcome(&joined)
            .unwrap_or_else(|| exited(0, "", ""));
        let keep = |stream: Stream, text: Option<String>| {
            (stream == Stream::Capture).then(|| text.unwrap_or_default())
        };
        Ok(match outcome {
            RunOutcome::Exited(out) => RunOutcome::Exited(ExecOutput {
                code: out.code,
                stdout: keep(spec.stdout, out.stdout),
                stderr: keep(spec.stderr, out.stderr),
            }),
            RunOutcome::TimedOut => RunOutcome::TimedOut,
        })
    }
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> RunOutcome {
    RunOutcome::Exited(ExecOutput {
        code,
        stdout: Some(stdout.to_string()),
        stderr: Some(stderr.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(argv: &[&str]) -> RunSpec {
        RunSpec {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            stdout: Stream::Capture,
            stderr: Stream::Inherit,
            timeout: Duration::from_secs(1),
            wait_after_kill: true,
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn longest_pattern_wins_and_last_outcome_repeats() {
        let runner = ScriptedRunner::new();
        runner.on("apt-get", exited(1, "short", ""));
        runner.on("apt-get install", exited(2, "a", ""));
        runner.on("apt-get install", exited(3, "b", "ignored"));

        let code = |o: RunOutcome| match o {
            RunOutcome::Exited(out) => (out.code, out.stdout, out.stderr),
            RunOutcome::TimedOut => panic!("timed out"),
        };
        let install = spec(&["env", "apt-get", "install", "foo"]);
        assert_eq!(code(runner.run(&install).await.unwrap()), (2, Some("a".into()), None));
        assert_eq!(code(runner.run(&install).await.unwrap()), (3, Some("b".into()), None));
        assert_eq!(code(runner.run(&install).await.unwrap()).0, 3);
        assert_eq!(code(runner.run(&spec(&["apt-get", "update"])).await.unwrap()).0, 1);
        assert_eq!(code(runner.run(&spec(&["true"])).await.unwrap()), (0, Some(String::new()), None));
        assert_eq!(runner.count_matching("apt-get install"), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fake_server_answers_the_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let (server, mut transport) =
            FakeVirtServer::spawn(FakeVirtConfig::with_caps(&["revert"]).file("-log", "hi\n"));
        transport.expect("ok", Some(0)).await.unwrap();
        let open = transport.command(adt_protocol::Verb::Open, &[], Some(1)).await.unwrap();
        assert_eq!(open, vec!["/scratch".to_string()]);
        let dst = dir.path().join("x-log");
        let dst = dst.to_string_lossy();
        transport
            .command(adt_protocol::Verb::Copyup, &["/scratch/x-log", &dst], Some(0))
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("x-log")).unwrap(), "hi\n");
        let revert = transport.command(adt_protocol::Verb::Revert, &[], Some(1)).await.unwrap();
        assert_eq!(revert, vec!["/scratch-1".to_string()]);
        assert_eq!(server.count("copyup"), 1);
    }
}

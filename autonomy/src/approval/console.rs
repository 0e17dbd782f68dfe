//! Interactive terminal approval.
//!
//! The prompt blocks a thread until the operator answers. The async path
//! moves it onto tokio's blocking pool so it never stalls the scheduler,
//! but each pending prompt still occupies one blocking-pool thread.

use std::io::{self, BufRead, BufReader, Write};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, warn};

use super::backend::ApprovalBackend;
use super::types::{ApprovalDecision, ApprovalRequest};

type SharedReader = Arc<Mutex<Box<dyn BufRead + Send>>>;
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

#[derive(Clone)]
pub struct ConsoleBackend {
    reader: SharedReader,
    writer: SharedWriter,
    approver: String,
}

impl ConsoleBackend {
    /// Prompt on stderr, read answers from stdin.
    pub fn stdio() -> Self {
        Self::with_io(BufReader::new(io::stdin()), io::stderr())
    }

    pub fn with_io(reader: impl BufRead + Send + 'static, writer: impl Write + Send + 'static) -> Self {
        Self {
            reader: Arc::new(Mutex::new(Box::new(reader))),
            writer: Arc::new(Mutex::new(Box::new(writer))),
            approver: "console".to_string(),
        }
    }

    pub fn with_approver(mut self, approver: impl Into<String>) -> Self {
        self.approver = approver.into();
        self
    }

    fn prompt(&self, request: &ApprovalRequest) -> io::Result<Option<bool>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        writeln!(writer, "{}", request.describe())?;
        loop {
            write!(writer, "Approve? [y/n]: ")?;
            writer.flush()?;

            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(Some(true)),
                "n" | "no" => return Ok(Some(false)),
                _ => writeln!(writer, "Please answer 'y' or 'n'.")?,
            }
        }
    }
}

#[async_trait]
impl ApprovalBackend for ConsoleBackend {
    fn name(&self) -> &str {
        "console"
    }

    fn request_approval_sync(&self, request: &ApprovalRequest) -> ApprovalDecision {
        match self.prompt(request) {
            Ok(Some(true)) => {
                info!(operation = %request.operation, "Console approval granted");
                ApprovalDecision::approve("approved at console").by(&self.approver)
            }
            Ok(Some(false)) => {
                info!(operation = %request.operation, "Console approval denied");
                ApprovalDecision::deny("denied at console").by(&self.approver)
            }
            Ok(None) => {
                warn!(operation = %request.operation, "Console input closed, denying");
                ApprovalDecision::deny("input closed before an answer was given")
            }
            Err(e) => {
                warn!(operation = %request.operation, error = %e, "Console prompt failed, denying");
                ApprovalDecision::deny(format!("console unavailable: {e}"))
            }
        }
    }

    async fn request_approval(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let backend = self.clone();
        let request = request.clone();
        let operation = request.operation.clone();
        match tokio::task::spawn_blocking(move || backend.request_approval_sync(&request)).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(operation = %operation, error = %e, "Console prompt task failed, denying");
                ApprovalDecision::deny(format!("console prompt aborted: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::RiskLevel;
    use serde_json::json;
    use std::io::Cursor;

    /// Writer that keeps what was written, for assertions.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn request() -> ApprovalRequest {
        ApprovalRequest::new("delete_file", json!({"path": "a.txt"}), RiskLevel::High)
    }

    #[test]
    fn test_yes_approves() {
        let out = Captured::default();
        let backend = ConsoleBackend::with_io(Cursor::new("yes\n"), out.clone());
        let decision = backend.request_approval_sync(&request());
        assert!(decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("console"));
        let printed = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(printed.contains("delete_file"));
    }

    #[test]
    fn test_reprompts_until_valid_answer() {
        let backend = ConsoleBackend::with_io(Cursor::new("maybe\nN\n"), io::sink());
        assert!(!backend.request_approval_sync(&request()).approved);
    }

    #[test]
    fn test_eof_denies() {
        let backend = ConsoleBackend::with_io(Cursor::new(""), io::sink());
        let decision = backend.request_approval_sync(&request());
        assert!(!decision.approved);
        assert!(decision.reason.contains("input closed"));
    }

    #[tokio::test]
    async fn test_async_runs_off_the_scheduler() {
        let backend = ConsoleBackend::with_io(Cursor::new("y\n"), io::sink()).with_approver("ops");
        let decision = backend.request_approval(&request()).await;
        assert!(decision.approved);
        assert_eq!(decision.approver.as_deref(), Some("ops"));
    }
}

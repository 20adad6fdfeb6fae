//! Calls the orchestrator makes into the host editor

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::methods::{self, *};
use super::{RpcError, RpcPeer};
use crate::patch::{PatchError, PatchWriter, Region};

/// Everything the orchestrator needs from the host
///
/// Fire-and-forget methods return nothing; a dropped notification is logged.
/// Blocking methods stall only the calling session's run.
#[async_trait]
pub trait HostApi: Send + Sync {
    fn flush_output(&self, session: &Path, chunk: OutputChunk);

    async fn request_tool_approval(
        &self,
        session: &Path,
        tool_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<bool, RpcError>;

    async fn ask_user(
        &self,
        session: &Path,
        question: &str,
        options: &[String],
    ) -> Result<Option<String>, RpcError>;

    async fn execute_in_host(&self, session: &Path, command: &str) -> Result<String, RpcError>;

    async fn replace_regions(&self, file: &Path, regions: &[Region]) -> Result<(), RpcError>;

    async fn list_files(&self, dir: &Path, recursive: bool) -> Result<String, RpcError>;

    async fn search_files(
        &self,
        dir: &Path,
        pattern: &str,
        case_sensitive: bool,
        max_matches: usize,
    ) -> Result<String, RpcError>;

    fn signal_completion(&self, session: &Path, result_text: &str, demo_command: Option<&str>);

    fn agent_finished(&self, session: &Path);

    fn file_written_externally(&self, path: &Path);
}

/// [`HostApi`] over the host link
pub struct RpcHost {
    peer: Arc<RpcPeer>,
}

impl RpcHost {
    pub fn new(peer: Arc<RpcPeer>) -> Self {
        Self { peer }
    }

    fn fire<P: serde::Serialize>(&self, method: &str, params: P) {
        if let Err(e) = self.peer.notify(method, params) {
            warn!("Host notification {} dropped: {}", method, e);
        }
    }
}

#[async_trait]
impl HostApi for RpcHost {
    fn flush_output(&self, session: &Path, chunk: OutputChunk) {
        self.fire(
            methods::FLUSH_OUTPUT,
            FlushOutputParams {
                session_path: session.to_path_buf(),
                chunk,
            },
        );
    }

    async fn request_tool_approval(
        &self,
        session: &Path,
        tool_name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<bool, RpcError> {
        let display = serde_json::to_string_pretty(params).unwrap_or_default();
        self.peer
            .call(
                methods::REQUEST_TOOL_APPROVAL,
                ToolApprovalParams {
                    session_path: session.to_path_buf(),
                    tool_name: tool_name.to_string(),
                    params: params.clone(),
                    display,
                },
            )
            .await
    }

    async fn ask_user(
        &self,
        session: &Path,
        question: &str,
        options: &[String],
    ) -> Result<Option<String>, RpcError> {
        self.peer
            .call(
                methods::ASK_USER,
                AskUserParams {
                    session_path: session.to_path_buf(),
                    question: question.to_string(),
                    options: options.to_vec(),
                },
            )
            .await
    }

    async fn execute_in_host(&self, session: &Path, command: &str) -> Result<String, RpcError> {
        self.peer
            .call(
                methods::EXECUTE_IN_HOST,
                ExecuteInHostParams {
                    session_path: session.to_path_buf(),
                    command: command.to_string(),
                },
            )
            .await
    }

    async fn replace_regions(&self, file: &Path, regions: &[Region]) -> Result<(), RpcError> {
        let _: serde_json::Value = self
            .peer
            .call(
                methods::REPLACE_REGIONS,
                ReplaceRegionsParams {
                    file_path: file.to_path_buf(),
                    regions: regions.to_vec(),
                },
            )
            .await?;
        Ok(())
    }

    async fn list_files(&self, dir: &Path, recursive: bool) -> Result<String, RpcError> {
        self.peer
            .call(
                methods::LIST_FILES,
                ListFilesParams {
                    dir: dir.to_path_buf(),
                    recursive,
                },
            )
            .await
    }

    async fn search_files(
        &self,
        dir: &Path,
        pattern: &str,
        case_sensitive: bool,
        max_matches: usize,
    ) -> Result<String, RpcError> {
        self.peer
            .call(
                methods::SEARCH_FILES,
                SearchFilesParams {
                    dir: dir.to_path_buf(),
                    pattern: pattern.to_string(),
                    case_sensitive,
                    max_matches,
                },
            )
            .await
    }

    fn signal_completion(&self, session: &Path, result_text: &str, demo_command: Option<&str>) {
        self.fire(
            methods::SIGNAL_COMPLETION,
            SignalCompletionParams {
                session_path: session.to_path_buf(),
                result_text: result_text.to_string(),
                demo_command: demo_command.map(str::to_string),
            },
        );
    }

    fn agent_finished(&self, session: &Path) {
        self.fire(
            methods::AGENT_FINISHED,
            SessionParams {
                session_path: session.to_path_buf(),
            },
        );
    }

    fn file_written_externally(&self, path: &Path) {
        self.fire(
            methods::FILE_WRITTEN_EXTERNALLY,
            FileWrittenParams {
                path: path.to_path_buf(),
            },
        );
    }
}

/// Applies patches as region edits in the host's buffers
///
/// The host saves the buffer afterwards, so the next staleness check reads
/// the new content from disk.
pub struct HostWriter {
    host: Arc<dyn HostApi>,
}

impl HostWriter {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl PatchWriter for HostWriter {
    async fn write(&self, file: &Path, regions: &[Region], _content: &str) -> Result<(), PatchError> {
        self.host.replace_regions(file, regions).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcHandler;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    /// Stands in for the editor side of the link
    struct FakeEditor {
        seen: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RpcHandler for FakeEditor {
        async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.seen.lock().push((method.to_string(), params.clone()));
            match method {
                methods::REQUEST_TOOL_APPROVAL => Ok(json!(params["tool_name"] != "execute_command")),
                methods::ASK_USER => Ok(Value::Null),
                methods::REPLACE_REGIONS => Ok(Value::Null),
                _ => Ok(json!("ok")),
            }
        }

        async fn handle_notification(&self, method: &str, params: Value) {
            self.seen.lock().push((method.to_string(), params));
        }
    }

    fn connect() -> (RpcHost, Arc<FakeEditor>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let editor = Arc::new(FakeEditor {
            seen: Mutex::new(Vec::new()),
        });

        let orchestrator_side = RpcPeer::connect("orchestrator", a_write);
        let editor_side = RpcPeer::connect("editor", b_write);
        orchestrator_side.serve(a_read, Arc::new(FakeEditor { seen: Mutex::new(Vec::new()) }));
        editor_side.serve(b_read, editor.clone());
        (RpcHost::new(orchestrator_side), editor)
    }

    #[tokio::test]
    async fn test_approval_round_trip_carries_session() {
        let (host, editor) = connect();
        let mut params = BTreeMap::new();
        params.insert("path".to_string(), "a.py".to_string());

        assert!(host
            .request_tool_approval(Path::new("/proj"), "write_to_file", &params)
            .await
            .unwrap());
        assert!(!host
            .request_tool_approval(Path::new("/proj"), "execute_command", &params)
            .await
            .unwrap());

        let seen = editor.seen.lock();
        assert_eq!(seen[0].1["session_path"], "/proj");
        assert!(seen[0].1["display"].as_str().unwrap().contains("a.py"));
    }

    #[tokio::test]
    async fn test_null_answer_is_none() {
        let (host, _editor) = connect();
        let answer = host
            .ask_user(Path::new("/proj"), "Which?", &["a".into()])
            .await
            .unwrap();
        assert_eq!(answer, None);
    }

    #[tokio::test]
    async fn test_flush_output_is_flattened() {
        let (host, editor) = connect();
        host.flush_output(
            Path::new("/proj"),
            OutputChunk::new(StreamRole::ToolJson, "").with_tool("t1", Some("read_file")),
        );
        host.replace_regions(Path::new("/proj/a.py"), &[])
            .await
            .unwrap();

        let seen = editor.seen.lock();
        let (method, params) = &seen[0];
        assert_eq!(method, methods::FLUSH_OUTPUT);
        assert_eq!(params["role"], "tool_json");
        assert_eq!(params["tool_name"], "read_file");
        assert_eq!(params["session_path"], "/proj");
    }

    #[tokio::test]
    async fn test_host_writer_sends_regions() {
        use super::testing::{HostEvent, RecordingHost};

        let recording = Arc::new(RecordingHost::default());
        let writer = HostWriter::new(recording.clone());
        let regions = vec![Region {
            start_line: 3,
            end_line: 4,
            text: "bar\n".into(),
        }];
        writer
            .write(Path::new("/proj/a.py"), &regions, "ignored")
            .await
            .unwrap();
        assert_eq!(
            recording.events(),
            vec![HostEvent::Regions("/proj/a.py".into(), regions)]
        );
    }
}

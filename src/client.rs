use std::error::Error;
use std::io::Write;

use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::config::{self, ChatArgs};
use crate::protocol::{
    ChatRequest, ContentPart, ConversationTurn, DataEvent, ErrorBody, InvocationState,
    ProcessingState, ToolInvocation, visible_parts,
};
use crate::stream::{DataStreamDecoder, DataStreamPart, StreamDecodeError};

type ClientResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const MAX_TABLE_ROWS: usize = 20;

/// Something the user should see as soon as it arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Text(String),
    Reasoning(String),
    Status(ProcessingState),
    ToolCall { name: String },
    ToolResult { name: String, success: bool },
    Annotation(Value),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    /// Columns come from the first record; missing cells are null.
    fn from_records(records: &[Value]) -> Option<Self> {
        let first = records.first()?.as_object()?;
        let columns: Vec<String> = first.keys().cloned().collect();
        let rows = records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|column| record.get(column).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Some(Self { columns, rows })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Artifacts {
    pub sql: Option<String>,
    pub table: Option<Table>,
}

#[derive(Debug, Clone, Default)]
pub struct MessageAssembler {
    parts: Vec<ContentPart>,
    timeline: Vec<ProcessingState>,
    annotations: Vec<Value>,
    errors: Vec<String>,
    artifacts: Artifacts,
    finished: bool,
}

impl MessageAssembler {
    pub fn apply(&mut self, part: DataStreamPart) -> Vec<ClientUpdate> {
        match part {
            DataStreamPart::Text(text) => {
                match self.parts.last_mut() {
                    Some(ContentPart::Text { text: current }) => current.push_str(&text),
                    _ => self.parts.push(ContentPart::Text { text: text.clone() }),
                }
                vec![ClientUpdate::Text(text)]
            }
            DataStreamPart::Reasoning(text) => vec![ClientUpdate::Reasoning(text)],
            DataStreamPart::Data(values) => values
                .into_iter()
                .filter_map(|value| match serde_json::from_value::<DataEvent>(value) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "ignoring unknown data object");
                        None
                    }
                })
                .map(|event| self.apply_event(event))
                .collect(),
            DataStreamPart::Error(text) => {
                self.errors.push(text.clone());
                vec![ClientUpdate::Error(text)]
            }
            DataStreamPart::Annotations(values) => {
                self.annotations.extend(values.iter().cloned());
                values.into_iter().map(ClientUpdate::Annotation).collect()
            }
            DataStreamPart::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                self.parts.push(ContentPart::ToolInvocation {
                    tool_invocation: ToolInvocation {
                        tool_call_id,
                        tool_name: tool_name.clone(),
                        args,
                        state: InvocationState::Pending,
                        result: None,
                    },
                });
                vec![ClientUpdate::ToolCall { name: tool_name }]
            }
            DataStreamPart::ToolResult {
                tool_call_id,
                result,
            } => self.apply_tool_result(&tool_call_id, result),
            DataStreamPart::FinishMessage { .. } => {
                self.finished = true;
                Vec::new()
            }
            DataStreamPart::StartStep { .. } | DataStreamPart::FinishStep { .. } => Vec::new(),
        }
    }

    fn apply_event(&mut self, event: DataEvent) -> ClientUpdate {
        match event {
            DataEvent::ProcessingState { state } => {
                self.timeline.push(state);
                ClientUpdate::Status(state)
            }
            DataEvent::Error { text } => {
                self.errors.push(text.clone());
                ClientUpdate::Error(text)
            }
            DataEvent::Reasoning { result, .. } => ClientUpdate::Reasoning(result),
        }
    }

    fn apply_tool_result(&mut self, tool_call_id: &str, result: Value) -> Vec<ClientUpdate> {
        let invocation = self.parts.iter_mut().find_map(|part| match part {
            ContentPart::ToolInvocation { tool_invocation } if tool_invocation.tool_call_id == tool_call_id => {
                Some(tool_invocation)
            }
            _ => None,
        });
        let Some(invocation) = invocation else {
            warn!(tool_call_id, "tool result without a matching call");
            return Vec::new();
        };

        let success = result.get("success").and_then(Value::as_bool).unwrap_or(false);
        if success {
            match invocation.tool_name.as_str() {
                "generateSQLQuery" => {
                    if let Some(sql) = result.get("sql").and_then(Value::as_str) {
                        self.artifacts.sql = Some(sql.to_string());
                    }
                }
                "executeSQLQuery" => {
                    if let Some(records) = result.get("queryResults").and_then(Value::as_array) {
                        self.artifacts.table = Table::from_records(records);
                    }
                }
                _ => {}
            }
        }

        invocation.state = InvocationState::Result;
        invocation.result = Some(result);
        vec![ClientUpdate::ToolResult {
            name: invocation.tool_name.clone(),
            success,
        }]
    }

    /// The answer as a chat UI would show it, without tool narration.
    pub fn text(&self) -> String {
        visible_parts(&self.parts)
            .into_iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn status(&self) -> Option<ProcessingState> {
        self.timeline.last().copied()
    }

    pub fn timeline(&self) -> &[ProcessingState] {
        &self.timeline
    }

    pub fn annotations(&self) -> &[Value] {
        &self.annotations
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_turn(self) -> ConversationTurn {
        ConversationTurn::assistant_with_parts(self.parts)
    }
}

/// Holds the conversation; the server keeps none, so every request carries all of it.
pub struct ChatClient {
    base_url: String,
    token: String,
    db_connection_id: String,
    http: HttpClient,
    history: Vec<ConversationTurn>,
}

impl ChatClient {
    pub fn new(base_url: &str, token: String, db_connection_id: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            db_connection_id,
            http: HttpClient::new(),
            history: Vec::new(),
        }
    }

    /// Sends `text` with the whole history and feeds every update to
    /// `on_update` while the answer streams in.
    pub async fn send<F>(&mut self, text: &str, mut on_update: F) -> ClientResult<MessageAssembler>
    where
        F: FnMut(ClientUpdate),
    {
        self.history.push(ConversationTurn::user(text));
        let result = self.stream_answer(&mut on_update).await;
        match result {
            Ok(assembler) => {
                self.history.push(assembler.clone().into_turn());
                Ok(assembler)
            }
            Err(e) => {
                self.history.pop();
                Err(e)
            }
        }
    }

    async fn stream_answer<F>(&self, on_update: &mut F) -> ClientResult<MessageAssembler>
    where
        F: FnMut(ClientUpdate),
    {
        let request = ChatRequest {
            messages: self.history.clone(),
            db_connection_id: self.db_connection_id.clone(),
        };
        let response = self
            .http
            .post(format!("{}/chat", self.base_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|body| body.error)
                .unwrap_or(body);
            return Err(format!("Chat request failed: {status} - {message}").into());
        }

        let mut stream = response.bytes_stream();
        let mut decoder = DataStreamDecoder::default();
        let mut assembler = MessageAssembler::default();

        while let Some(chunk) = stream.next().await {
            for decoded in decoder.push_chunk(&chunk?) {
                feed(decoded, &mut assembler, on_update);
            }
        }
        if let Some(decoded) = decoder.finish() {
            feed(decoded, &mut assembler, on_update);
        }

        Ok(assembler)
    }
}

fn feed<F>(
    decoded: Result<DataStreamPart, StreamDecodeError>,
    assembler: &mut MessageAssembler,
    on_update: &mut F,
) where
    F: FnMut(ClientUpdate),
{
    match decoded {
        Ok(part) => assembler.apply(part).into_iter().for_each(on_update),
        Err(e) => warn!(error = %e, "skipping undecodable stream line"),
    }
}

pub async fn run(args: ChatArgs) -> ClientResult<()> {
    let token = config::resolve_client_token(args.token)?;
    let mut client = ChatClient::new(&args.url, token, args.db_connection_id);

    println!("Connected to {}. Ask a question, or Ctrl-D to quit.", args.url);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match client.send(line, print_update).await {
            Ok(assembler) => println!("\n{}", render_answer(&assembler)),
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}

/// Progress only; the answer is drawn once the stream ends so that text
/// written ahead of a tool call never reaches the screen.
fn print_update(update: ClientUpdate) {
    match update {
        ClientUpdate::Status(state) => eprintln!("[{}]", status_label(state)),
        ClientUpdate::ToolResult { name, success: false } => eprintln!("[{name} failed]"),
        ClientUpdate::Text(_)
        | ClientUpdate::Reasoning(_)
        | ClientUpdate::ToolCall { .. }
        | ClientUpdate::ToolResult { .. }
        | ClientUpdate::Annotation(_)
        | ClientUpdate::Error(_) => {}
    }
}

fn render_answer(assembler: &MessageAssembler) -> String {
    let mut out = Vec::new();
    let text = assembler.text();
    if !text.trim().is_empty() {
        out.push(text.trim().to_string());
    }
    // A fatal error arrives both as a data object and as a `3:` part.
    let mut errors: Vec<&String> = assembler.errors().iter().collect();
    errors.dedup();
    out.extend(errors.into_iter().map(|error| format!("error: {error}")));
    if !assembler.is_finished() {
        let at = assembler.status().map(status_label).unwrap_or("start");
        out.push(format!("(response ended early, last step: {at})"));
    }

    let steps: Vec<&str> = assembler.timeline().iter().copied().map(status_label).collect();
    if !steps.is_empty() {
        out.push(format!("steps: {}", steps.join(" > ")));
    }
    if !assembler.annotations().is_empty() {
        out.push(format!("{} annotations", assembler.annotations().len()));
    }

    let artifacts = assembler.artifacts();
    if let Some(sql) = &artifacts.sql {
        out.push(format!("\nSQL:\n  {sql}"));
    }
    if let Some(table) = &artifacts.table {
        out.push(format!("\n{}", render_table(table)));
    }
    out.join("\n")
}

fn status_label(state: ProcessingState) -> &'static str {
    match state {
        ProcessingState::Thinking => "thinking",
        ProcessingState::FetchingSql => "writing SQL",
        ProcessingState::ExecutingSql => "running query",
        ProcessingState::GeneratingInsights => "summarizing",
        ProcessingState::Completed => "done",
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn render_table(table: &Table) -> String {
    let shown = &table.rows[..table.rows.len().min(MAX_TABLE_ROWS)];
    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.chars().count()).collect();
    for row in shown {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell(value).chars().count());
        }
    }

    let line = |cells: Vec<String>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<width$}", width = *w))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![line(table.columns.clone())];
    out.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    out.extend(shown.iter().map(|row| line(row.iter().map(cell).collect())));
    if table.rows.len() > shown.len() {
        out.push(format!("... {} more rows", table.rows.len() - shown.len()));
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::FinishReason;
    use serde_json::json;

    fn decode_all(body: &str) -> Vec<DataStreamPart> {
        let mut decoder = DataStreamDecoder::default();
        decoder
            .push_chunk(body.as_bytes())
            .into_iter()
            .map(Result::unwrap)
            .collect()
    }

    const DATABASE_ANSWER: &str = concat!(
        "2:[{\"type\":\"ProcessingState\",\"state\":\"thinking\"}]\n",
        "f:{\"messageId\":\"msg-1\"}\n",
        "0:\"Let me look that up.\"\n",
        "9:{\"toolCallId\":\"c1\",\"toolName\":\"generateSQLQuery\",\"args\":{\"question\":\"q\"}}\n",
        "2:[{\"type\":\"ProcessingState\",\"state\":\"fetchingSQL\"}]\n",
        "a:{\"toolCallId\":\"c1\",\"result\":{\"success\":true,\"queryId\":\"q1\",\"sql\":\"SELECT 1\",\"message\":\"ok\"}}\n",
        "e:{\"finishReason\":\"tool-calls\",\"isContinued\":false}\n",
        "9:{\"toolCallId\":\"c2\",\"toolName\":\"executeSQLQuery\",\"args\":{\"queryId\":\"q1\"}}\n",
        "2:[{\"type\":\"ProcessingState\",\"state\":\"executingSQL\"}]\n",
        "a:{\"toolCallId\":\"c2\",\"result\":{\"success\":true,\"queryResults\":[{\"region\":\"EMEA\",\"total\":3},{\"region\":\"APAC\"}],\"message\":\"ok\"}}\n",
        "0:\"EMEA leads \"\n",
        "0:\"with 3.\"\n",
        "2:[{\"type\":\"ProcessingState\",\"state\":\"completed\"}]\n",
        "d:{\"finishReason\":\"stop\"}\n",
    );

    #[test]
    fn assembler_rebuilds_text_timeline_and_artifacts() {
        let mut assembler = MessageAssembler::default();
        let mut updates = Vec::new();
        for part in decode_all(DATABASE_ANSWER) {
            updates.extend(assembler.apply(part));
        }

        assert_eq!(assembler.text(), "EMEA leads with 3.");
        assert_eq!(
            assembler.timeline(),
            &[
                ProcessingState::Thinking,
                ProcessingState::FetchingSql,
                ProcessingState::ExecutingSql,
                ProcessingState::Completed
            ]
        );
        assert_eq!(assembler.status(), Some(ProcessingState::Completed));
        assert!(assembler.is_finished());

        let artifacts = assembler.artifacts();
        assert_eq!(artifacts.sql.as_deref(), Some("SELECT 1"));
        let table = artifacts.table.as_ref().unwrap();
        assert_eq!(table.columns, vec!["region", "total"]);
        assert_eq!(table.rows[1], vec![json!("APAC"), Value::Null]);

        assert!(updates.contains(&ClientUpdate::ToolResult {
            name: "executeSQLQuery".into(),
            success: true
        }));

        let turn = assembler.into_turn();
        assert_eq!(turn.tool_invocations().count(), 2);
        assert!(
            turn.tool_invocations()
                .all(|invocation| invocation.state == InvocationState::Result)
        );
    }

    #[test]
    fn errors_and_annotations_are_collected() {
        let mut assembler = MessageAssembler::default();
        assembler.apply(DataStreamPart::Data(vec![
            json!({"type": "Error", "text": "Failed to generate SQL query"}),
            json!({"type": "Unknown"}),
        ]));
        assembler.apply(DataStreamPart::Annotations(vec![json!({"sql": "SELECT 2"})]));
        let updates = assembler.apply(DataStreamPart::Error("fatal".into()));

        assert_eq!(updates, vec![ClientUpdate::Error("fatal".into())]);
        assert_eq!(
            assembler.errors(),
            &["Failed to generate SQL query".to_string(), "fatal".to_string()]
        );
        assert_eq!(assembler.annotations().len(), 1);
        assert!(!assembler.is_finished());
    }

    #[test]
    fn failed_tool_results_leave_no_artifacts() {
        let mut assembler = MessageAssembler::default();
        assembler.apply(DataStreamPart::ToolCall {
            tool_call_id: "c1".into(),
            tool_name: "generateSQLQuery".into(),
            args: json!({}),
        });
        let updates = assembler.apply(DataStreamPart::ToolResult {
            tool_call_id: "c1".into(),
            result: json!({"success": false, "error": "boom"}),
        });
        assembler.apply(DataStreamPart::FinishMessage {
            finish_reason: FinishReason::Stop,
        });

        assert_eq!(
            updates,
            vec![ClientUpdate::ToolResult {
                name: "generateSQLQuery".into(),
                success: false
            }]
        );
        assert_eq!(assembler.artifacts(), &Artifacts::default());
    }

    #[test]
    fn rendered_answer_hides_narration() {
        let mut assembler = MessageAssembler::default();
        for part in decode_all(DATABASE_ANSWER) {
            assembler.apply(part);
        }

        let rendered = render_answer(&assembler);
        assert!(rendered.starts_with("EMEA leads with 3.\n"));
        assert!(!rendered.contains("Let me look that up."));
        assert!(rendered.contains("steps: thinking > writing SQL > running query > done"));
        assert!(rendered.contains("SQL:\n  SELECT 1"));
        assert!(rendered.ends_with("APAC   |"));
    }

    #[test]
    fn rendered_answer_reports_an_early_end() {
        let body = concat!(
            "2:[{\"type\":\"ProcessingState\",\"state\":\"thinking\"}]\n",
            "2:[{\"type\":\"Error\",\"text\":\"Sorry, try again.\"}]\n",
            "3:\"Sorry, try again.\"\n",
        );
        let mut assembler = MessageAssembler::default();
        for part in decode_all(body) {
            assembler.apply(part);
        }

        assert_eq!(
            render_answer(&assembler),
            "error: Sorry, try again.\n(response ended early, last step: thinking)\nsteps: thinking"
        );
    }

    #[test]
    fn tables_render_with_aligned_columns() {
        let table = Table {
            columns: vec!["region".into(), "total".into()],
            rows: vec![vec![json!("EMEA"), json!(3)], vec![json!("APAC"), Value::Null]],
        };
        assert_eq!(
            render_table(&table),
            "region | total\n-------+------\nEMEA   | 3\nAPAC   |"
        );
    }

    #[test]
    fn base_url_is_normalized() {
        let client = ChatClient::new("http://localhost:8787/", "t".into(), "db1".into());
        assert_eq!(client.base_url, "http://localhost:8787");
        assert!(client.history.is_empty());
    }
}

//! Tests for stream parsing and channel integration.

use claude_session_pool::cli::{StreamError, StreamParser, WorkerEvent};

#[test]
fn parse_line_valid_json() {
    let line = r#"{"type":"result","is_error":false,"result":"ok"}"#;
    let result = StreamParser::parse_line(line);

    assert!(result.is_ok());
    assert!(result.unwrap().is_terminal());
}

#[test]
fn parse_line_invalid_json() {
    let line = "not valid json at all";
    let result = StreamParser::parse_line(line);

    match result.unwrap_err() {
        StreamError::ParseError { input, reason: _ } => {
            assert_eq!(input, "not valid json at all");
        }
        other => panic!("Expected ParseError, got {other:?}"),
    }
}

#[test]
fn parse_line_empty_string() {
    assert!(matches!(
        StreamParser::parse_line("").unwrap_err(),
        StreamError::ParseError { .. }
    ));
}

#[test]
fn parse_line_missing_type_tag() {
    let result = StreamParser::parse_line(r#"{"session_id":"abc"}"#);
    assert!(matches!(result, Err(StreamError::ParseError { .. })));
}

#[test]
fn parse_or_skip_drops_garbage() {
    assert!(StreamParser::parse_or_skip("{broken").is_none());
    assert!(StreamParser::parse_or_skip(r#"{"type":"system","subtype":"init"}"#).is_some());
}

#[tokio::test]
async fn into_channel_reassembles_split_lines() {
    let reader = tokio_test::io::Builder::new()
        .read(b"{\"type\":\"system\",\"subtype\":")
        .read(b"\"init\",\"session_id\":\"tok\"}\n{\"type\":\"res")
        .read(b"ult\",\"is_error\":false,\"result\":\"hi\"}\n")
        .build();

    let mut rx = StreamParser::into_channel(reader, 16);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.continuation_token(), Some("tok"));

    let second = rx.recv().await.unwrap();
    assert!(second.is_terminal());

    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn into_channel_skips_invalid_and_empty_lines() {
    use tokio::io::AsyncWriteExt;

    let (reader, mut writer) = tokio::io::duplex(1024);

    tokio::spawn(async move {
        writer.write_all(b"\n   \n").await.unwrap();
        writer.write_all(b"invalid json\n").await.unwrap();
        writer
            .write_all(b"{\"type\":\"assistant\",\"message\":{\"content\":[]}}\n")
            .await
            .unwrap();
        drop(writer);
    });

    let mut rx = StreamParser::into_channel(reader, 16);

    let event = rx.recv().await.unwrap();
    assert!(matches!(event, WorkerEvent::Assistant { .. }));
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn into_channel_parses_unterminated_final_line() {
    let reader = tokio_test::io::Builder::new()
        .read(b"{\"type\":\"result\",\"is_error\":true}")
        .build();

    let mut rx = StreamParser::into_channel(reader, 4);
    let event = rx.recv().await.unwrap();
    assert!(event.is_terminal());
    assert!(rx.recv().await.is_none());
}

//! End-to-end polling of a real directory through the file system manager.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use filepoll_transport::{
    Action, ChannelEngine, EntryConfig, FixedClock, MessageBody, Outcome, PollEntry, Scanner,
    TransportConfig,
};
use filepoll_vfs::{FileSystemManager, MemoryFileSystem};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn file_uri(path: &std::path::Path) -> String {
    format!("file://{}", path.display())
}

#[tokio::test]
async fn test_poll_local_directory() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let inbox = temp_dir.path().join("inbox");
    let done = temp_dir.path().join("done");
    std::fs::create_dir_all(&inbox)?;
    std::fs::write(inbox.join("input.xml"), "<input/>")?;
    std::fs::write(inbox.join("readme.md"), "skip me")?;

    let (engine, mut rx) = ChannelEngine::new(8);
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 6, 0, 0).unwrap());
    let scanner = Scanner::new(Arc::new(FileSystemManager::with_local()), Arc::new(engine))
        .with_clock(Arc::new(clock));
    let mut entry = PollEntry::new(
        EntryConfig::new(file_uri(&inbox))
            .with_pattern(r".*\.xml")
            .after_process(Action::move_with_timestamp(file_uri(&done), "%Y%m%d-")),
    )?;

    assert_eq!(scanner.poll(&mut entry).await?, Outcome::Success);

    let request = rx.recv().await.unwrap();
    assert!(matches!(request.message.body, MessageBody::Xml { ref root, .. } if root == "input"));
    assert!(done.join("20240115-input.xml").exists());
    assert!(!inbox.join("input.xml").exists());
    assert!(!inbox.join("input.xml.lock").exists());
    assert!(inbox.join("readme.md").exists());
    Ok(())
}

#[tokio::test]
async fn test_move_across_backends() {
    let temp_dir = TempDir::new().unwrap();
    let inbox = temp_dir.path().join("inbox");
    std::fs::create_dir_all(&inbox).unwrap();
    std::fs::write(inbox.join("note.txt"), "hello").unwrap();

    let memory = MemoryFileSystem::new();
    let manager = FileSystemManager::with_local().with_backend("mem", Arc::new(memory.clone()));
    let (engine, mut rx) = ChannelEngine::new(8);
    let scanner = Scanner::new(Arc::new(manager), Arc::new(engine));

    let config = TransportConfig::from_json_str(&format!(
        r#"{{
            "locking": false,
            "entries": [{{
                "file_uri": "{}",
                "action_after_process": {{ "action": "move", "destination": "mem:///archive" }}
            }}]
        }}"#,
        file_uri(&inbox)
    ))
    .unwrap();
    let mut entries = tokio_test::assert_ok!(config.build_entries());

    let outcome = tokio::time::timeout(Duration::from_secs(5), scanner.poll(&mut entries[0]))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome, Outcome::Success);
    assert!(matches!(rx.recv().await.unwrap().message.body, MessageBody::Text(ref t) if t == "hello"));
    assert_eq!(memory.read_file("/archive/note.txt"), Some(b"hello".to_vec()));
    assert!(!inbox.join("note.txt").exists());
}

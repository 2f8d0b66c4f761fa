//! End-to-end session lifecycle across a process restart.

use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use parley_core::config::{PersistenceConfig, StorageBackendKind};
use parley_core::{CompressionConfig, CompressionStrategy, Error, Message, Role, SessionLink};
use parley_session::{
    open_backend, PersistenceManager, SessionStore, StoreSettings, Summarizer,
};

struct CannedSummarizer;

#[async_trait]
impl Summarizer for CannedSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<String> {
        Ok(format!("The user and assistant exchanged {} messages.", messages.len()))
    }
}

struct BrokenSummarizer;

#[async_trait]
impl Summarizer for BrokenSummarizer {
    async fn summarize(&self, _messages: &[Message]) -> anyhow::Result<String> {
        anyhow::bail!("model overloaded")
    }
}

fn settings() -> StoreSettings {
    StoreSettings {
        compression_defaults: CompressionConfig {
            strategy: CompressionStrategy::SlidingWindow,
            sliding_window_message_threshold: 10,
            sliding_window_keep_last: 4,
            ..CompressionConfig::default()
        },
        ..StoreSettings::default()
    }
}

fn open(dir: &TempDir, backend: StorageBackendKind) -> SessionStore {
    let storage = open_backend(backend, dir.path()).unwrap();
    let persistence = PersistenceManager::start(
        storage,
        PersistenceConfig {
            save_delay_ms: 50,
            batch_size: 8,
            shutdown_timeout_ms: 5_000,
        },
    );
    SessionStore::new(persistence, settings())
}

async fn full_lifecycle(backend: StorageBackendKind) {
    let dir = TempDir::new().unwrap();

    let (chat, scheduled, doomed) = {
        let store = open(&dir, backend);
        assert_eq!(store.restore().await.unwrap(), 0);

        let chat = store
            .append_or_create(None, Message::user("Help me write a haiku about autumn"))
            .unwrap();
        for i in 0..11 {
            let msg = if i % 2 == 0 {
                Message::assistant(format!("Draft {}", i)).with_actual_tokens(12)
            } else {
                Message::user(format!("Revise it, attempt {}", i))
            };
            store.add_message(&chat, msg).unwrap();
        }

        let result = store
            .compact_if_needed(&chat, &CannedSummarizer, None)
            .await
            .unwrap()
            .expect("12 messages cross the threshold of 10");
        assert_eq!(result.archived_messages.len(), 8);
        assert!(!result.used_fallback);

        let scheduled = store
            .create(Some(SessionLink::ScheduledTask("nightly-digest".to_string())))
            .unwrap();
        store.update_title(&scheduled, Some("Nightly digest".to_string())).unwrap();

        let doomed = store.create(None).unwrap();
        store.add_message(&doomed, Message::user("temporary")).unwrap();
        store.save_now(&doomed).await.unwrap();
        store.delete(&doomed).await.unwrap();

        store.shutdown().await.unwrap();
        (chat, scheduled, doomed)
    };

    // Restart
    let store = open(&dir, backend);
    assert_eq!(store.restore().await.unwrap(), 2);

    let session = store.get(&chat).unwrap();
    assert_eq!(session.title(), Some("Help me write a haiku about autumn"));
    assert_eq!(session.messages().len(), 5);
    assert_eq!(session.messages()[0].role, Role::System);
    assert!(session.messages()[0]
        .content
        .as_text()
        .contains("exchanged 8 messages"));
    assert_eq!(session.archived_messages().len(), 8);
    assert_eq!(session.compression_count(), 1);
    assert_eq!(session.compression_config().sliding_window_keep_last, 4);

    let digest = store.get(&scheduled).unwrap();
    assert_eq!(digest.title(), Some("Nightly digest"));
    assert_eq!(
        digest.link(),
        Some(&SessionLink::ScheduledTask("nightly-digest".to_string()))
    );

    assert!(matches!(store.get(&doomed), Err(Error::NotFound(_))));

    let listed = store.list();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, scheduled);

    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_json_backend() {
    full_lifecycle(StorageBackendKind::Json).await;
}

#[tokio::test]
async fn test_lifecycle_sqlite_backend() {
    full_lifecycle(StorageBackendKind::Sqlite).await;
}

#[tokio::test]
async fn test_summarizer_failure_still_compacts_and_persists() {
    let dir = TempDir::new().unwrap();
    let id = {
        let store = open(&dir, StorageBackendKind::Json);
        let id = store.create(None).unwrap();
        for i in 0..10 {
            store
                .add_message(&id, Message::user(format!("Point number {}", i)))
                .unwrap();
        }

        let result = store.compact(&id, &BrokenSummarizer, None).await.unwrap();
        assert!(result.used_fallback);
        assert!(result.summary_generated);
        store.shutdown().await.unwrap();
        id
    };

    let store = open(&dir, StorageBackendKind::Json);
    store.restore().await.unwrap();
    let session = store.get(&id).unwrap();
    let context = session.messages()[0].content.as_text();
    assert!(context.contains("6 messages (6 from the user, 0 from the assistant)"));
    assert!(context.contains("Point number 0"));
    store.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_sessions_written_in_background() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open(&dir, StorageBackendKind::Json));

    let tasks = (0..20).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let id = store
                .append_or_create(None, Message::user(format!("conversation {}", i)))
                .unwrap();
            for j in 0..5 {
                store
                    .add_message(&id, Message::assistant(format!("reply {}", j)))
                    .unwrap();
            }
            id
        })
    });
    let ids: Vec<String> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    store.shutdown().await.unwrap();

    let reopened = open(&dir, StorageBackendKind::Json);
    assert_eq!(reopened.restore().await.unwrap(), 20);
    for id in &ids {
        assert_eq!(reopened.get(id).unwrap().messages().len(), 6);
    }
    reopened.shutdown().await.unwrap();
}

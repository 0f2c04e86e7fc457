use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread;

use awful_recall::MemoryStore;
use awful_recall::config::RecallConfig;
use awful_recall::conversation::{ConversationTurn, Role};
use awful_recall::embeddings::{EmbeddingProvider, HashingEmbedder};
use awful_recall::persistence::PersistenceManager;

const DIM: usize = 128;

fn config(buffer_size: usize, dir: Option<&Path>) -> RecallConfig {
    let mut config = RecallConfig {
        dimension: DIM,
        buffer_size,
        nlist: 8,
        nprobe: 8,
        ..Default::default()
    };
    if let Some(dir) = dir {
        config.save_path = dir.to_path_buf();
    }
    config
}

fn in_memory(buffer_size: usize) -> MemoryStore {
    MemoryStore::in_memory(config(buffer_size, None), Arc::new(HashingEmbedder::new(DIM))).unwrap()
}

fn open(buffer_size: usize, dir: &Path) -> MemoryStore {
    MemoryStore::open(config(buffer_size, Some(dir)), Arc::new(HashingEmbedder::new(DIM))).unwrap()
}

#[test]
fn history_round_trips_in_append_order() {
    let store = in_memory(100);
    let turns = [
        (Role::User, "How do I read a file in Rust?"),
        (Role::Assistant, "Use std::fs::read_to_string."),
        (Role::User, "And write one?"),
        (Role::Assistant, "std::fs::write works too."),
    ];
    for (role, content) in turns {
        store.add_to_conversation("alice", role, content).unwrap();
    }

    let expected: Vec<ConversationTurn> = turns
        .iter()
        .map(|(role, content)| ConversationTurn::new(*role, *content))
        .collect();
    assert_eq!(store.get_conversation_history("alice").unwrap(), expected);
    assert!(store.get_conversation_history("nobody").unwrap().is_empty());
}

#[test]
fn search_is_empty_until_the_buffer_fills() {
    let store = in_memory(5);
    for i in 0..4 {
        store
            .add_to_conversation("alice", Role::User, format!("note number {i}"))
            .unwrap();
        assert!(store.search("alice", "note number 0", 3).unwrap().is_empty());
    }

    store.add_to_conversation("alice", Role::User, "note number 4").unwrap();
    let stats = store.stats();
    assert!(stats.trained);
    assert_eq!(stats.indexed, 5);
    assert_eq!(stats.training_events, 1);
    assert!(!store.search("alice", "note number 0", 3).unwrap().is_empty());

    for i in 5..10 {
        store
            .add_to_conversation("alice", Role::User, format!("note number {i}"))
            .unwrap();
    }
    let stats = store.stats();
    assert_eq!(stats.indexed, 10);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.training_events, 1);
}

#[test]
fn two_user_scenario() {
    let store = in_memory(2);
    store.add_to_conversation("alice", Role::User, "hello").unwrap();
    store.add_to_conversation("alice", Role::User, "goodbye").unwrap();
    assert_eq!(store.stats().training_events, 1);
    assert_eq!(store.search("alice", "hello", 1).unwrap(), vec!["hello"]);

    store.add_to_conversation("bob", Role::User, "hello").unwrap();
    let hits = store.search_hits("bob", "hello", 1).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].turn.content, "hello");
    assert_eq!(hits[0].position, 0);

    // Alice's own "hello" is still position 0 of her log, not bob's.
    let alice = store.search_hits("alice", "hello", 5).unwrap();
    let contents: Vec<&str> = alice.iter().map(|h| h.turn.content.as_str()).collect();
    assert_eq!(contents, vec!["hello", "goodbye"]);
}

#[test]
fn search_never_returns_another_users_turns() {
    let store = in_memory(4);
    let secrets = ["launch code alpha", "bank pin 1234", "secret recipe"];
    for s in secrets {
        store.add_to_conversation("alice", Role::User, s).unwrap();
    }
    for s in ["weather today", "football scores", "launch party"] {
        store.add_to_conversation("bob", Role::User, s).unwrap();
    }
    assert!(store.stats().trained);

    let bob_history: HashSet<String> = store
        .get_conversation_history("bob")
        .unwrap()
        .into_iter()
        .map(|t| t.content)
        .collect();

    for query in secrets {
        for result in store.search("bob", query, 10).unwrap() {
            assert!(bob_history.contains(&result), "leaked {result:?} to bob");
        }
    }
    assert!(store.search("carol", "launch code alpha", 10).unwrap().is_empty());
}

#[test]
fn persistence_round_trip_reproduces_history_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let queries = ["rust ownership", "python decorators", "coffee", "hello"];
    let users = ["alice", "bob"];

    let (histories, results) = {
        let store = open(4, dir.path());
        let turns = [
            ("alice", Role::User, "rust ownership rules"),
            ("alice", Role::Assistant, "each value has one owner"),
            ("bob", Role::User, "python decorators explained"),
            ("alice", Role::User, "rust borrowing"),
            ("bob", Role::User, "coffee brewing tips"),
            ("bob", Role::Assistant, "use fresh beans"),
            ("alice", Role::User, "hello there"),
            ("bob", Role::User, "hello from bob"),
        ];
        for (user, role, content) in turns {
            store.add_to_conversation(user, role, content).unwrap();
        }
        // Four user turns were flushed; three more stay pending across the restart.
        store.add_to_conversation("alice", Role::User, "coffee or tea").unwrap();
        assert_eq!(store.stats().pending, 3);
        store.save().unwrap();
        assert!(!store.is_dirty());

        let histories: Vec<_> = users
            .iter()
            .map(|u| store.get_conversation_history(u).unwrap())
            .collect();
        let results: Vec<_> = users
            .iter()
            .flat_map(|u| queries.iter().map(|q| store.search(u, q, 3).unwrap()))
            .collect();
        (histories, results)
    };

    let reloaded = open(4, dir.path());
    let stats = reloaded.stats();
    assert!(stats.trained);
    assert_eq!(stats.indexed, 4);
    assert_eq!(stats.pending, 3);
    assert_eq!(stats.training_events, 1);

    for (user, history) in users.iter().zip(&histories) {
        assert_eq!(&reloaded.get_conversation_history(user).unwrap(), history);
    }
    let reloaded_results: Vec<_> = users
        .iter()
        .flat_map(|u| queries.iter().map(|q| reloaded.search(u, q, 3).unwrap()))
        .collect();
    assert_eq!(reloaded_results, results);

    // The buffer survived, so one more user turn completes the next flush.
    reloaded
        .add_to_conversation("bob", Role::User, "after restart")
        .unwrap();
    let stats = reloaded.stats();
    assert_eq!(stats.indexed, 8);
    assert_eq!(stats.training_events, 1);
}

#[test]
fn missing_state_files_start_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(2, &dir.path().join("fresh"));
    let stats = store.stats();
    assert_eq!(stats.users, 0);
    assert!(!stats.trained);
}

#[test]
fn corrupt_index_file_keeps_conversations() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(2, dir.path());
        store.add_to_conversation("alice", Role::User, "hello").unwrap();
        store.add_to_conversation("alice", Role::User, "goodbye").unwrap();
        store.save().unwrap();
    }

    let pm = PersistenceManager::new(dir.path(), "default");
    fs::write(pm.index_path(), b"garbage").unwrap();

    let store = open(2, dir.path());
    assert_eq!(store.get_conversation_history("alice").unwrap().len(), 2);
    assert!(!store.stats().trained);
    assert!(store.search("alice", "hello", 1).unwrap().is_empty());
}

#[test]
fn missing_index_file_discards_only_vector_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(2, dir.path());
        store.add_to_conversation("alice", Role::User, "hello").unwrap();
        store.add_to_conversation("alice", Role::User, "goodbye").unwrap();
        store.save().unwrap();
    }

    let pm = PersistenceManager::new(dir.path(), "default");
    fs::remove_file(pm.index_path()).unwrap();

    let store = open(2, dir.path());
    assert_eq!(store.get_conversation_history("alice").unwrap().len(), 2);
    let stats = store.stats();
    assert!(!stats.trained);
    assert_eq!(stats.indexed, 0);
    assert!(store.search("alice", "hello", 1).unwrap().is_empty());
}

#[test]
fn concurrent_appends_train_once_and_keep_logs_ordered() {
    let store = Arc::new(in_memory(10));
    let writers: Vec<_> = (0..8)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let user = format!("user{t}");
                for i in 0..25 {
                    store
                        .add_to_conversation(&user, Role::User, format!("{user} message {i}"))
                        .unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let user = format!("user{t}");
                for _ in 0..50 {
                    for result in store.search(&user, "message", 5).unwrap() {
                        assert!(result.starts_with(&user));
                    }
                }
            })
        })
        .collect();
    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }

    let stats = store.stats();
    assert_eq!(stats.turns, 200);
    assert_eq!(stats.indexed, 200);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.training_events, 1);

    for t in 0..8 {
        let user = format!("user{t}");
        let history = store.get_conversation_history(&user).unwrap();
        let expected: Vec<String> = (0..25).map(|i| format!("{user} message {i}")).collect();
        let actual: Vec<String> = history.into_iter().map(|turn| turn.content).collect();
        assert_eq!(actual, expected);

        for result in store.search(&user, &format!("{user} message 3"), 5).unwrap() {
            assert!(result.starts_with(&format!("{user} ")));
        }
    }
}

/// Hashing embedder that holds the embedding of one text until released.
struct GatedEmbedder {
    inner: HashingEmbedder,
    gated: &'static str,
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl GatedEmbedder {
    fn new(gated: &'static str) -> (Self, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let embedder = Self {
            inner: HashingEmbedder::new(DIM),
            gated,
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        };
        (embedder, started_rx, release_tx)
    }
}

impl EmbeddingProvider for GatedEmbedder {
    fn embed(&self, text: &str) -> awful_recall::Result<Vec<f32>> {
        if text == self.gated {
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        self.inner.embed(text)
    }

    fn dimension(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "gated"
    }
}

/// Appends `content` for alice while `save()` runs mid-embedding, then returns the store.
fn save_during_embedding(
    buffer_size: usize,
    dir: &Path,
    earlier: &[&str],
    content: &'static str,
) -> Arc<MemoryStore> {
    let (embedder, started, release) = GatedEmbedder::new(content);
    let store = Arc::new(
        MemoryStore::open(config(buffer_size, Some(dir)), Arc::new(embedder)).unwrap(),
    );
    for text in earlier {
        store.add_to_conversation("alice", Role::User, *text).unwrap();
    }

    let writer = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.add_to_conversation("alice", Role::User, content))
    };
    started.recv().unwrap();
    // The turn is in the log, its vector is not yet buffered.
    store.save().unwrap();
    assert!(!store.is_dirty());
    release.send(()).unwrap();
    writer.join().unwrap().unwrap();
    store
}

#[test]
fn vector_buffered_after_a_save_marks_the_store_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let store = save_during_embedding(2, dir.path(), &[], "hello");
    assert!(store.is_dirty());
    assert_eq!(store.stats().pending, 1);
    store.save().unwrap();
    drop(store);

    let reopened = open(2, dir.path());
    assert_eq!(reopened.stats().pending, 1);
    reopened.add_to_conversation("alice", Role::User, "goodbye").unwrap();
    let stats = reopened.stats();
    assert!(stats.trained);
    assert_eq!(stats.indexed, 2);
    assert_eq!(reopened.search("alice", "hello", 1).unwrap(), vec!["hello"]);
}

#[test]
fn flush_after_a_save_marks_the_store_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let store = save_during_embedding(2, dir.path(), &["alpha"], "beta");
    assert!(store.is_dirty());
    assert!(store.stats().trained);
    store.save().unwrap();
    drop(store);

    let reopened = open(2, dir.path());
    let stats = reopened.stats();
    assert!(stats.trained);
    assert_eq!(stats.indexed, 2);
    assert_eq!(stats.pending, 0);
}

#[test]
fn torn_save_discards_vectors_from_the_newer_index() {
    let dir = tempfile::tempdir().unwrap();
    let pm = PersistenceManager::new(dir.path(), "default");
    {
        let store = open(2, dir.path());
        store.add_to_conversation("alice", Role::User, "alpha").unwrap();
        store.add_to_conversation("alice", Role::User, "beta").unwrap();
        store.save().unwrap();
        let older_snapshot = fs::read(pm.snapshot_path()).unwrap();

        store.add_to_conversation("alice", Role::User, "hello").unwrap();
        store.save().unwrap();
        // Crash after the index file was replaced but before the snapshot was.
        fs::write(pm.snapshot_path(), older_snapshot).unwrap();
    }

    let store = open(2, dir.path());
    assert_eq!(store.get_conversation_history("alice").unwrap().len(), 2);
    let stats = store.stats();
    assert!(!stats.trained);
    assert_eq!(stats.pending, 0);

    store
        .add_to_conversation("alice", Role::Assistant, "an unrelated assistant reply")
        .unwrap();
    for hit in store.search_hits("alice", "hello", 3).unwrap() {
        assert_eq!(hit.turn.role, Role::User);
    }
}

#[test]
fn short_term_memory_capacity_scenario() {
    let mut config = config(2, None);
    config.short_term.max_memories = 2;
    let store = MemoryStore::in_memory(config, Arc::new(HashingEmbedder::new(DIM))).unwrap();

    store.add_memory("a", false);
    store.add_memory("b", false);
    store.add_memory("c", false);
    assert!(store.get_relevant_memories("a").is_empty());
    assert_eq!(store.get_relevant_memories("b"), vec!["b"]);
    assert_eq!(store.get_relevant_memories("c"), vec!["c"]);
}

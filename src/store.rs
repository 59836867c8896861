//! Reactive state store
//!
//! The canonical client-side view of the user, the conversation list and
//! each conversation's messages. Three kinds of input are merged:
//!
//! - REST snapshots replace metadata and message lists
//! - streaming events append deltas and finalize placeholders
//! - optimistic writes insert user messages before the server confirms
//!
//! When a REST snapshot and streamed state disagree about the same entity,
//! the later timestamp wins and ties go to the streamed copy. Local entries
//! the snapshot does not know yet (in-flight responses, unconfirmed sends)
//! survive the replace. A streamed message whose finalized content already
//! appears in the snapshot is dropped, so reconnects never duplicate it.
//!
//! Every collection is published through a `tokio::sync::watch` channel: a
//! new subscriber sees the current value first, then every change.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::api::types::{Conversation, Delivery, Message, Origin, User};
use crate::generation::GenerationEvent;

/// Length of the last-message preview stored on a conversation.
const PREVIEW_CHARS: usize = 120;

#[derive(Debug)]
struct Tracked {
    conversation: Conversation,
    origin: Origin,
}

#[derive(Debug, Default)]
struct Inner {
    conversations: HashMap<String, Tracked>,
    messages: HashMap<String, Vec<Message>>,
    /// Placeholder message id of each in-flight response.
    streaming: HashMap<String, String>,
    message_watchers: HashMap<String, watch::Sender<Vec<Message>>>,
}

/// Observable client state.
#[derive(Debug)]
pub struct StateStore {
    inner: Mutex<Inner>,
    user: watch::Sender<Option<User>>,
    conversations: watch::Sender<Vec<Conversation>>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            user: watch::channel(None).0,
            conversations: watch::channel(Vec::new()).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Observables
    // -----------------------------------------------------------------------

    /// Current user.
    pub fn user(&self) -> Option<User> {
        self.user.borrow().clone()
    }

    /// Watch the current user.
    pub fn subscribe_user(&self) -> watch::Receiver<Option<User>> {
        self.user.subscribe()
    }

    /// Conversations, most recently updated first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.conversations.borrow().clone()
    }

    /// Watch the conversation list.
    pub fn subscribe_conversations(&self) -> watch::Receiver<Vec<Conversation>> {
        self.conversations.subscribe()
    }

    /// The conversation list as a stream, starting with the current value.
    pub fn conversations_stream(&self) -> WatchStream<Vec<Conversation>> {
        WatchStream::new(self.subscribe_conversations())
    }

    /// Messages of `conversation_id` in arrival order.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Watch the messages of `conversation_id`.
    pub fn subscribe_messages(&self, conversation_id: &str) -> watch::Receiver<Vec<Message>> {
        let mut inner = self.lock();
        let current = inner
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        inner
            .message_watchers
            .entry(conversation_id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    /// The messages of `conversation_id` as a stream.
    pub fn messages_stream(&self, conversation_id: &str) -> WatchStream<Vec<Message>> {
        WatchStream::new(self.subscribe_messages(conversation_id))
    }

    fn publish_conversations(&self, inner: &Inner) {
        let mut list: Vec<Conversation> = inner
            .conversations
            .values()
            .map(|t| t.conversation.clone())
            .collect();
        list.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.conversations.send_replace(list);
    }

    fn publish_messages(inner: &Inner, conversation_id: &str) {
        if let Some(watcher) = inner.message_watchers.get(conversation_id) {
            let current = inner
                .messages
                .get(conversation_id)
                .cloned()
                .unwrap_or_default();
            watcher.send_replace(current);
        }
    }

    // -----------------------------------------------------------------------
    // REST input
    // -----------------------------------------------------------------------

    /// Replace the current user.
    pub fn set_user(&self, user: Option<User>) {
        self.user.send_replace(user);
    }

    /// Merge a full conversation listing.
    pub fn replace_conversations(&self, snapshot: Vec<Conversation>) {
        let mut inner = self.lock();
        let mut merged: HashMap<String, Tracked> = HashMap::with_capacity(snapshot.len());
        for conversation in snapshot {
            let keep_local = inner.conversations.get(&conversation.id).is_some_and(|local| {
                local.origin != Origin::Rest
                    && local.conversation.updated_at >= conversation.updated_at
            });
            let tracked = match inner.conversations.remove(&conversation.id) {
                Some(local) if keep_local => local,
                _ => Tracked {
                    conversation,
                    origin: Origin::Rest,
                },
            };
            merged.insert(tracked.conversation.id.clone(), tracked);
        }
        // Conversations only known locally are not deleted by a listing.
        for (id, local) in inner.conversations.drain() {
            if local.origin != Origin::Rest {
                merged.insert(id, local);
            }
        }
        inner.conversations = merged;
        self.publish_conversations(&inner);
    }

    /// Insert or update a single conversation from REST.
    pub fn upsert_conversation(&self, conversation: Conversation) {
        let mut inner = self.lock();
        let stale = inner.conversations.get(&conversation.id).is_some_and(|local| {
            local.origin != Origin::Rest && local.conversation.updated_at >= conversation.updated_at
        });
        if !stale {
            inner.conversations.insert(
                conversation.id.clone(),
                Tracked {
                    conversation,
                    origin: Origin::Rest,
                },
            );
            self.publish_conversations(&inner);
        }
    }

    /// Evict a conversation and its messages.
    pub fn remove_conversation(&self, conversation_id: &str) {
        let mut inner = self.lock();
        inner.conversations.remove(conversation_id);
        inner.messages.remove(conversation_id);
        inner.streaming.remove(conversation_id);
        Self::publish_messages(&inner, conversation_id);
        inner.message_watchers.remove(conversation_id);
        self.publish_conversations(&inner);
    }

    /// Merge a full message listing for `conversation_id`.
    pub fn replace_messages(&self, conversation_id: &str, snapshot: Vec<Message>) {
        let mut inner = self.lock();
        let local = inner.messages.remove(conversation_id).unwrap_or_default();
        let mut merged: Vec<Message> = snapshot
            .into_iter()
            .map(|mut m| {
                m.origin = Origin::Rest;
                m.delivery = Delivery::Sent;
                m
            })
            .collect();

        let snapshot_len = merged.len();
        // Position among messages the server knows about. Unsent messages
        // never appear in a listing and do not advance it.
        let mut position = 0;
        for message in local {
            let slot = position;
            if message.delivery == Delivery::Sent {
                position += 1;
            }
            if message.origin == Origin::Rest {
                continue;
            }
            if let Some(server) = merged.iter_mut().find(|m| m.id == message.id) {
                if message.timestamp >= server.timestamp {
                    *server = message;
                }
                continue;
            }
            // Pending and failed sends stay until retried or discarded.
            if message.delivery != Delivery::Sent {
                merged.push(message);
                continue;
            }
            // A finalized stream that never learned its server id is
            // superseded by the listed reply in the same slot.
            let superseded = message.origin == Origin::Streaming
                && message.is_complete
                && slot < snapshot_len
                && !merged[slot].is_from_user
                && merged[slot].is_complete;
            if !superseded {
                merged.push(message);
            }
        }

        let streaming_id = inner.streaming.get(conversation_id).cloned();
        if let Some(id) = streaming_id {
            if !merged.iter().any(|m| m.id == id) {
                inner.streaming.remove(conversation_id);
            }
        }
        inner.messages.insert(conversation_id.to_string(), merged);
        Self::publish_messages(&inner, conversation_id);
    }

    // -----------------------------------------------------------------------
    // Optimistic writes
    // -----------------------------------------------------------------------

    /// Insert a pending user message with a client-generated id.
    pub fn insert_optimistic(&self, conversation_id: &str, content: &str) -> Message {
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            is_from_user: true,
            timestamp: Utc::now(),
            follow_up_questions: Vec::new(),
            is_complete: true,
            delivery: Delivery::Pending,
            origin: Origin::Local,
        };
        let mut inner = self.lock();
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Self::touch_conversation(&mut inner, conversation_id, Some(content), None);
        Self::publish_messages(&inner, conversation_id);
        self.publish_conversations(&inner);
        message
    }

    /// Set the delivery status of a message. Returns `false` if missing.
    pub fn set_delivery(&self, conversation_id: &str, message_id: &str, delivery: Delivery) -> bool {
        let mut inner = self.lock();
        let Some(message) = inner
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        message.delivery = delivery;
        Self::publish_messages(&inner, conversation_id);
        true
    }

    /// Replace an optimistic message with the server's copy, in place.
    pub fn confirm_message(&self, conversation_id: &str, local_id: &str, mut server: Message) {
        server.origin = Origin::Rest;
        server.delivery = Delivery::Sent;
        let mut inner = self.lock();
        let list = inner.messages.entry(conversation_id.to_string()).or_default();
        match list.iter_mut().find(|m| m.id == local_id) {
            Some(slot) => *slot = server,
            None => list.push(server),
        }
        Self::publish_messages(&inner, conversation_id);
    }

    /// Find a message by id.
    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.lock()
            .messages
            .get(conversation_id)
            .and_then(|list| list.iter().find(|m| m.id == message_id))
            .cloned()
    }

    /// Remove an unconfirmed message. Returns `false` if it was not found or
    /// was already accepted by the server.
    pub fn discard_message(&self, conversation_id: &str, message_id: &str) -> bool {
        let mut inner = self.lock();
        let Some(list) = inner.messages.get_mut(conversation_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|m| !(m.id == message_id && m.delivery != Delivery::Sent));
        let removed = list.len() != before;
        if removed {
            Self::publish_messages(&inner, conversation_id);
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Streaming input
    // -----------------------------------------------------------------------

    /// Apply a generation transition.
    pub fn apply_generation(&self, event: &GenerationEvent) {
        let mut inner = self.lock();
        let conversation_id = event.conversation_id().to_string();
        match event {
            GenerationEvent::Started { .. } => {
                Self::ensure_placeholder(&mut inner, &conversation_id);
                Self::touch_conversation(&mut inner, &conversation_id, None, None);
            }
            GenerationEvent::Delta { chunk, .. } => {
                let id = Self::ensure_placeholder(&mut inner, &conversation_id);
                if let Some(message) = Self::find_mut(&mut inner, &conversation_id, &id) {
                    message.content.push_str(chunk);
                }
            }
            GenerationEvent::Completed {
                content,
                follow_up_questions,
                title,
                message_id,
                ..
            } => {
                let id = Self::ensure_placeholder(&mut inner, &conversation_id);
                if let Some(message) = Self::find_mut(&mut inner, &conversation_id, &id) {
                    message.content = content.clone();
                    message.follow_up_questions = follow_up_questions.clone();
                    message.is_complete = true;
                    message.timestamp = Utc::now();
                    if let Some(server_id) = message_id {
                        message.id = server_id.clone();
                    }
                }
                inner.streaming.remove(&conversation_id);
                Self::touch_conversation(&mut inner, &conversation_id, Some(content.as_str()), title.as_deref());
            }
            GenerationEvent::Stopped { content, .. } => {
                if let Some(id) = inner.streaming.remove(&conversation_id) {
                    if let Some(message) = Self::find_mut(&mut inner, &conversation_id, &id) {
                        message.is_complete = true;
                    }
                    Self::drop_if_empty(&mut inner, &conversation_id, &id);
                }
                if !content.is_empty() {
                    Self::touch_conversation(&mut inner, &conversation_id, Some(content.as_str()), None);
                }
            }
            GenerationEvent::Failed { .. } | GenerationEvent::Detached { .. } => {
                if let Some(id) = inner.streaming.remove(&conversation_id) {
                    Self::drop_if_empty(&mut inner, &conversation_id, &id);
                }
            }
        }
        Self::publish_messages(&inner, &conversation_id);
        self.publish_conversations(&inner);
    }

    fn find_mut<'a>(inner: &'a mut Inner, conversation_id: &str, id: &str) -> Option<&'a mut Message> {
        inner
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == id))
    }

    fn ensure_placeholder(inner: &mut Inner, conversation_id: &str) -> String {
        if let Some(id) = inner.streaming.get(conversation_id) {
            return id.clone();
        }
        let id = format!("stream-{}", uuid::Uuid::new_v4());
        inner
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(Message {
                id: id.clone(),
                conversation_id: conversation_id.to_string(),
                content: String::new(),
                is_from_user: false,
                timestamp: Utc::now(),
                follow_up_questions: Vec::new(),
                is_complete: false,
                delivery: Delivery::Sent,
                origin: Origin::Streaming,
            });
        inner
            .streaming
            .insert(conversation_id.to_string(), id.clone());
        id
    }

    fn drop_if_empty(inner: &mut Inner, conversation_id: &str, id: &str) {
        if let Some(list) = inner.messages.get_mut(conversation_id) {
            list.retain(|m| !(m.id == id && m.content.is_empty()));
        }
    }

    /// Bump `updated_at`, creating a local stub when the conversation is new.
    fn touch_conversation(
        inner: &mut Inner,
        conversation_id: &str,
        last_message: Option<&str>,
        title: Option<&str>,
    ) {
        let now = Utc::now();
        let tracked = inner
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Tracked {
                conversation: Conversation {
                    id: conversation_id.to_string(),
                    title: None,
                    localized_titles: HashMap::new(),
                    last_message: None,
                    tags: Vec::new(),
                    created_at: now,
                    updated_at: now,
                },
                origin: Origin::Streaming,
            });
        tracked.origin = Origin::Streaming;
        tracked.conversation.updated_at = now;
        if let Some(text) = last_message {
            tracked.conversation.last_message = Some(text.chars().take(PREVIEW_CHARS).collect());
        }
        if let Some(title) = title {
            tracked.conversation.title = Some(title.to_string());
        }
    }

    /// Drop everything (sign-out).
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.conversations.clear();
        inner.messages.clear();
        inner.streaming.clear();
        for watcher in inner.message_watchers.values() {
            watcher.send_replace(Vec::new());
        }
        self.publish_conversations(&inner);
        drop(inner);
        self.user.send_replace(None);
    }
}

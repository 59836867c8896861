//! Streaming generation controller
//!
//! One state machine per conversation:
//!
//! ```text
//! Idle --start--> Generating --complete--> Idle
//!                     |      --stopped---> Idle
//!                     |      --error-----> Failed(AIResponseError)
//!                     \--connection lost-> Failed(Interrupted)
//! ```
//!
//! `Failed` is terminal until the next `start`. The controller performs no
//! I/O besides handing frames to the transport; every transition yields a
//! [`GenerationEvent`] that the caller applies to the state store.
//!
//! A send that must persist the user message before generating takes a
//! [`Reservation`] first. While it is held no other local start can begin
//! in that conversation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use crate::collaborators::LocalizationProvider;
use crate::error::{GenerationError, SendError};
use crate::transport::{ClientFrame, ServerFrame, TransportConnection};

/// Generation state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GenerationState {
    /// No response in flight.
    #[default]
    Idle,
    /// A response is streaming.
    Generating,
    /// The last response ended abnormally.
    Failed(GenerationError),
}

/// Transition produced by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// A response began streaming.
    Started {
        /// Conversation the response belongs to.
        conversation_id: String,
    },
    /// A chunk was appended.
    Delta {
        /// Conversation the response belongs to.
        conversation_id: String,
        /// The appended text.
        chunk: String,
    },
    /// The response finished.
    Completed {
        /// Conversation the response belongs to.
        conversation_id: String,
        /// Full response text.
        content: String,
        /// Suggested next questions.
        follow_up_questions: Vec<String>,
        /// Conversation title generated alongside the response.
        title: Option<String>,
        /// Server id of the finalized message.
        message_id: Option<String>,
    },
    /// The server confirmed a stop request.
    Stopped {
        /// Conversation the response belongs to.
        conversation_id: String,
        /// Text received before the stop.
        content: String,
    },
    /// The response ended with an error. Partial content is kept.
    Failed {
        /// Conversation the response belongs to.
        conversation_id: String,
        /// Why it failed.
        error: GenerationError,
        /// Text received before the failure.
        content: String,
    },
    /// The conversation was left mid-response; later events are dropped.
    Detached {
        /// Conversation the response belongs to.
        conversation_id: String,
    },
}

impl GenerationEvent {
    /// Conversation the event belongs to.
    pub fn conversation_id(&self) -> &str {
        match self {
            GenerationEvent::Started { conversation_id }
            | GenerationEvent::Delta {
                conversation_id, ..
            }
            | GenerationEvent::Completed {
                conversation_id, ..
            }
            | GenerationEvent::Stopped {
                conversation_id, ..
            }
            | GenerationEvent::Failed {
                conversation_id, ..
            }
            | GenerationEvent::Detached { conversation_id } => conversation_id,
        }
    }

    /// Whether the event ends the response.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationEvent::Completed { .. }
                | GenerationEvent::Stopped { .. }
                | GenerationEvent::Failed { .. }
                | GenerationEvent::Detached { .. }
        )
    }
}

#[derive(Debug, Default)]
struct Slot {
    state: GenerationState,
    content: String,
    reserved_by: Option<u64>,
}

/// Exclusive right to start the next response in one conversation.
///
/// Released on drop unless [`start`](Reservation::start) consumed it.
#[derive(Debug)]
pub struct Reservation<'a> {
    controller: &'a GenerationController,
    conversation_id: String,
    id: u64,
}

impl Reservation<'_> {
    /// Conversation the reservation is for.
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Start the response this reservation was taken for.
    ///
    /// # Errors
    ///
    /// As [`GenerationController::start`]. `AlreadyGenerating` here means a
    /// response started remotely while the reservation was held.
    pub fn start(self, message: &str) -> std::result::Result<GenerationEvent, SendError> {
        self.controller
            .begin(&self.conversation_id, message, Some(self.id))
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut slots = self.controller.lock();
        if let Some(slot) = slots.get_mut(&self.conversation_id) {
            if slot.reserved_by == Some(self.id) {
                slot.reserved_by = None;
            }
        }
    }
}

/// Per-conversation generation state machines over the shared transport.
pub struct GenerationController {
    transport: Arc<TransportConnection>,
    locale: Arc<dyn LocalizationProvider>,
    slots: Mutex<HashMap<String, Slot>>,
    next_reservation: AtomicU64,
}

impl std::fmt::Debug for GenerationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationController")
            .field("slots", &self.slots)
            .finish_non_exhaustive()
    }
}

impl GenerationController {
    /// Create a controller sending through `transport`, tagging generate
    /// frames with the language from `locale`.
    pub fn new(transport: Arc<TransportConnection>, locale: Arc<dyn LocalizationProvider>) -> Self {
        Self {
            transport,
            locale,
            slots: Mutex::new(HashMap::new()),
            next_reservation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current state of `conversation_id`.
    pub fn state(&self, conversation_id: &str) -> GenerationState {
        self.lock()
            .get(conversation_id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Text accumulated for the current (or last failed) response.
    pub fn content(&self, conversation_id: &str) -> String {
        self.lock()
            .get(conversation_id)
            .map(|slot| slot.content.clone())
            .unwrap_or_default()
    }

    /// Ask the assistant to answer `message` in `conversation_id`.
    ///
    /// The generate frame is sent and the state becomes `Generating` under
    /// one lock, so two concurrent starts cannot both succeed.
    ///
    /// # Errors
    ///
    /// - [`GenerationError::AlreadyGenerating`] if a response is in flight
    ///   (no frame is sent)
    /// - [`TransportError::NotConnected`](crate::error::TransportError) if
    ///   the frame could not be sent (state unchanged)
    /// - [`GenerationError::AlreadyGenerating`] also while another caller
    ///   holds a [`Reservation`]
    pub fn start(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> std::result::Result<GenerationEvent, SendError> {
        self.begin(conversation_id, message, None)
    }

    /// Claim the next start in `conversation_id`.
    ///
    /// # Errors
    ///
    /// [`GenerationError::AlreadyGenerating`] if a response is in flight or
    /// the conversation is already reserved.
    pub fn reserve(&self, conversation_id: &str) -> std::result::Result<Reservation<'_>, GenerationError> {
        let mut slots = self.lock();
        let slot = slots.entry(conversation_id.to_string()).or_default();
        if slot.state == GenerationState::Generating || slot.reserved_by.is_some() {
            return Err(GenerationError::AlreadyGenerating);
        }
        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        slot.reserved_by = Some(id);
        Ok(Reservation {
            controller: self,
            conversation_id: conversation_id.to_string(),
            id,
        })
    }

    fn begin(
        &self,
        conversation_id: &str,
        message: &str,
        reservation: Option<u64>,
    ) -> std::result::Result<GenerationEvent, SendError> {
        let mut slots = self.lock();
        let slot = slots.entry(conversation_id.to_string()).or_default();
        let reserved_elsewhere = slot.reserved_by.is_some() && slot.reserved_by != reservation;
        if slot.state == GenerationState::Generating || reserved_elsewhere {
            return Err(GenerationError::AlreadyGenerating.into());
        }

        let frame = ClientFrame::Generate {
            conversation_id: conversation_id.to_string(),
            message: message.to_string(),
            language: self.locale.current_language_code(),
        };
        self.transport.send(&frame)?;

        slot.state = GenerationState::Generating;
        slot.content.clear();
        slot.reserved_by = None;
        info!(conversation_id, "Generation started");
        Ok(GenerationEvent::Started {
            conversation_id: conversation_id.to_string(),
        })
    }

    /// Request that the current response stop.
    ///
    /// A no-op unless `Generating`. The state stays `Generating` until the
    /// server reports the outcome; a failed send is ignored.
    pub fn stop(&self, conversation_id: &str) {
        if self.state(conversation_id) != GenerationState::Generating {
            return;
        }
        let frame = ClientFrame::StopGeneration {
            conversation_id: conversation_id.to_string(),
        };
        if let Err(e) = self.transport.send(&frame) {
            debug!(conversation_id, "Stop not sent: {}", e);
        }
    }

    /// Apply an inbound frame, in transport arrival order.
    pub fn handle_frame(&self, frame: ServerFrame) -> Vec<GenerationEvent> {
        let mut slots = self.lock();
        let slot = slots.entry(frame.conversation_id().to_string()).or_default();

        match frame {
            ServerFrame::Delta {
                conversation_id,
                chunk,
            } => match slot.state {
                GenerationState::Generating => {
                    slot.content.push_str(&chunk);
                    vec![GenerationEvent::Delta {
                        conversation_id,
                        chunk,
                    }]
                }
                GenerationState::Idle => {
                    // Started elsewhere (another device of the same user).
                    debug!(%conversation_id, "Remote generation started");
                    slot.state = GenerationState::Generating;
                    slot.content = chunk.clone();
                    vec![
                        GenerationEvent::Started {
                            conversation_id: conversation_id.clone(),
                        },
                        GenerationEvent::Delta {
                            conversation_id,
                            chunk,
                        },
                    ]
                }
                GenerationState::Failed(_) => {
                    debug!(%conversation_id, "Dropping delta for failed generation");
                    Vec::new()
                }
            },

            ServerFrame::Complete {
                conversation_id,
                follow_up_questions,
                title,
                message_id,
            } => {
                if slot.state != GenerationState::Generating {
                    debug!(%conversation_id, "Dropping completion without generation");
                    return Vec::new();
                }
                slot.state = GenerationState::Idle;
                info!(%conversation_id, "Generation completed");
                vec![GenerationEvent::Completed {
                    conversation_id,
                    content: std::mem::take(&mut slot.content),
                    follow_up_questions,
                    title,
                    message_id,
                }]
            }

            ServerFrame::Stopped { conversation_id } => {
                if slot.state != GenerationState::Generating {
                    // Stop raced with completion.
                    return Vec::new();
                }
                slot.state = GenerationState::Idle;
                info!(%conversation_id, "Generation stopped");
                vec![GenerationEvent::Stopped {
                    conversation_id,
                    content: std::mem::take(&mut slot.content),
                }]
            }

            ServerFrame::Error {
                conversation_id,
                message,
            } => {
                if slot.state != GenerationState::Generating {
                    debug!(%conversation_id, "Dropping error without generation");
                    return Vec::new();
                }
                warn!(%conversation_id, "Generation failed: {}", message);
                let error = GenerationError::AIResponseError(message);
                slot.state = GenerationState::Failed(error.clone());
                vec![GenerationEvent::Failed {
                    conversation_id,
                    error,
                    content: slot.content.clone(),
                }]
            }
        }
    }

    /// Fail every in-flight response with `Interrupted`.
    pub fn on_connection_lost(&self) -> Vec<GenerationEvent> {
        let mut slots = self.lock();
        let mut events = Vec::new();
        for (conversation_id, slot) in slots.iter_mut() {
            if slot.state == GenerationState::Generating {
                warn!(%conversation_id, "Generation interrupted");
                slot.state = GenerationState::Failed(GenerationError::Interrupted);
                events.push(GenerationEvent::Failed {
                    conversation_id: conversation_id.clone(),
                    error: GenerationError::Interrupted,
                    content: slot.content.clone(),
                });
            }
        }
        events.sort_by(|a, b| a.conversation_id().cmp(b.conversation_id()));
        events
    }

    /// Stop tracking a response because its conversation was left.
    ///
    /// The server keeps generating; its completion will be dropped.
    pub fn leave(&self, conversation_id: &str) -> Option<GenerationEvent> {
        let mut slots = self.lock();
        match slots.get(conversation_id) {
            Some(slot) if slot.state == GenerationState::Generating => {
                slots.remove(conversation_id);
                debug!(conversation_id, "Detached from generation");
                Some(GenerationEvent::Detached {
                    conversation_id: conversation_id.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Forget every conversation (sign-out).
    pub fn clear(&self) {
        self.lock().clear();
    }
}

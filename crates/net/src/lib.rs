//! Arena Network Library
//!
//! Serves battle engines over TCP and gives clients the same operations.
//!
//! # Architecture
//!
//! - **Server**: Owns the engine, answers requests, pushes session events
//! - **Client**: Connects to a server; implements [`BattleApi`]
//! - **LocalBattle**: The same API over an in-process engine
//! - **Protocol**: Length-prefixed JSON messages
//! - **ExitHandler** / **Reconciler**: Client-side leave and view sync
//!
//! # Usage
//!
//! ```ignore
//! // Serve an engine
//! let server = Server::start(&config.server, engine).await?;
//!
//! // Client connects and follows a match
//! let client = Arc::new(Client::connect(addr, config.client.request_timeout()).await?);
//! let (view_tx, view_rx) = watch::channel(None);
//! let outcome = Reconciler::new(client.clone(), player_id, lobby_code, config.client.poll_interval())
//!     .with_session_uuid(session_uuid)
//!     .run(view_tx)
//!     .await;
//! ```

pub mod api;
pub mod client;
pub mod error;
pub mod exit;
mod frame;
pub mod protocol;
pub mod reconcile;
pub mod server;

pub use api::{assign_first_turn, BattleApi, LocalBattle};
pub use client::{Client, ConnectionState};
pub use error::{Error, Result};
pub use exit::{ExitHandler, ExitState, LeaveContext, LeaveOutcome, SessionTeardown};
pub use protocol::{ErrorKind, Message, Request, Response};
pub use reconcile::{FinalOutcome, PlayerResult, Reconciler};
pub use server::Server;

//! Account-level API for the campaign platform.
//!
//! [`CampaignApi`] binds the database, the command bus and the external
//! contact and opt-out stores together. [`UserApi`] scopes it to one
//! account and implements the conversation lifecycle:
//!
//! ```text
//! draft ──start_conversation──▶ running ──end_conversation──▶ finished
//!          │ acquire tag                  │ batch_done
//!          │ batch_start                  │ release tags
//!          │ add_batch
//!          └ send "start" to <type>_application
//! ```
//!
//! # Example
//!
//! ```no_run
//! use account_api::CampaignApi;
//! use database::{Database, NewConversation};
//! use message_bus::MessageBus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::connect("sqlite:campaign.db?mode=rwc").await?;
//! db.migrate().await?;
//! let api = CampaignApi::new(db, MessageBus::new());
//!
//! let user_api = api.user_api("acc-1");
//! let conv = user_api
//!     .new_conversation(
//!         &NewConversation::new("bulk_message", "Launch", "Hello!")
//!             .with_delivery_class("sms")
//!             .with_delivery_pool("longcode")
//!             .with_group("group-1"),
//!     )
//!     .await?;
//! let batch_id = user_api.start_conversation(&conv.key).await?;
//! println!("started batch {}", batch_id);
//! # Ok(())
//! # }
//! ```

mod api;
pub mod contact;
mod error;
pub mod msg_options;
pub mod opt_out;
pub mod polls;
mod user_api;

pub use api::CampaignApi;
pub use contact::{Contact, ContactStore, MemoryContactStore};
pub use error::{ApiError, Result};
pub use msg_options::PoolMetadata;
pub use opt_out::{MemoryOptOutStore, OptOutStore};
pub use user_api::{application_worker_name, UserApi, APPLICATION_WORKER_SUFFIX};

//! Service layer for the monitoring engine.
//!
//! This module contains the business logic for:
//! - Fetching and parsing source documents (`Fetcher`, `ParserRegistry`)
//! - Change detection against stored snapshots (`ChangeDetector`)
//! - Severity classification (`SeverityClassifier`)
//! - Notification dispatch and digests (`NotificationDispatcher`)
//! - Audit queries (`AuditTrail`)

pub mod audit;
pub mod classifier;
pub mod delivery;
pub mod detector;
pub mod digest;
pub mod dispatcher;
pub mod fetcher;
pub mod parser;

pub use audit::AuditTrail;
pub use classifier::SeverityClassifier;
pub use delivery::{
    ChangeSummary, ChannelRouter, DeliveryChannel, LogChannel, Message, PreferenceProvider,
    StaticPreferences, WebhookChannel,
};
pub use detector::{ChangeDetector, Detection};
pub use digest::{DigestBuffer, DigestItem};
pub use dispatcher::{FlushReport, NotificationDispatcher};
pub use fetcher::{FetchTarget, Fetcher, HttpTarget, NoopObserver, RetryObserver};
pub use parser::{HtmlParser, Parser, ParserRegistry, TextParser};

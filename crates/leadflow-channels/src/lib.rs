//! # Leadflow Channels
//! Email delivery collaborators behind the `EmailSender` trait.
//!
//! - `http`: JSON email API (Resend-style), bearer key from secrets
//! - `smtp`: async lettre over STARTTLS, bodies rendered from template files
//! - `log`: dry run, logs the message and reports success

pub mod email;
pub mod templates;

pub use email::{HttpEmailSender, LogEmailSender, SmtpEmailSender, sender_from_config};
pub use templates::{RenderedEmail, TemplateStore, render};

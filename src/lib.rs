//! Session acquisition for the VTOP student portal: CSRF discovery, CAPTCHA
//! retrieval and classification, login outcome handling, and a single-flight
//! session cache shared by every request of one client.

pub mod captcha_solver;
pub mod client;
pub mod config;
pub mod error;
pub mod html_parser;
pub mod login;
pub mod network_client;
pub mod utils;

pub use client::VtopClient;
pub use config::{ClientConfig, Credentials};
pub use error::{LoginFailure, VtopError};
pub use login::EstablishedSession;
pub use network_client::{LoginOutcome, PortalPage};

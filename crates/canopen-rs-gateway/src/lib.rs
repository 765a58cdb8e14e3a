//! CiA 309-5 HTTP gateway for the canopen-rs master services.
//!
//! URL shape: `/cia309-5/1.0/{sequence}/{net}/{node}/{command}` where `net`
//! and `node` accept decimal, `0x`-prefixed hex and the keywords
//! `default`/`none`/`all`. Successful reads answer `{"data":"0x…"}`, other
//! successes `{"response":"OK"}`, and failures either a numeric
//! `{"ERROR":<code>}` or `{"ERROR":{"sdo-abort-code":"…"}}`.

pub mod command;
pub mod error;
pub mod server;

pub use command::{GatewayRequest, Token};
pub use error::GatewayError;
pub use server::{Executor, GatewayReply, router};

//! Companion core library: session store, classifier, dispatch bridge, Telegram
//! channel, model client, and the HTTP gateway used by the CLI.

pub mod channels;
pub mod classifier;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod prompt;
pub mod session;
pub mod store;

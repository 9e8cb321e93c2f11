//! Request model and the processor contract.
//!
//! A transport server turns each decoded unit into a [`Request`], refines it
//! into one [`RequestKind`] variant according to the provider's
//! [`PayloadKind`] and hands it to the connection's [`CommandProcessor`].

pub use model::{
    DataRequest, DefaultRequest, Request, RequestKind, TextRequest, AUTHORIZATION, COMMAND,
};
pub use processor::{BoxFuture, CommandProcessor, PayloadKind, ProcessorProvider};

#[cfg(test)]
pub(crate) use model::tests::{text_request, RecordingSender};

mod model;
mod processor;

//! Typed wrapper construction and readiness.

use std::sync::Arc;

use switchboard_traits::{
    Channel, ChannelError, ChannelKind, ChannelWrapper, Contact, WrapperFactory,
};

/// Build the wrapper for a ready channel. Tubes have none.
pub fn build_wrapper(
    kind: ChannelKind,
    channel: Arc<dyn Channel>,
    factory: &dyn WrapperFactory,
) -> Option<ChannelWrapper> {
    match kind {
        ChannelKind::Text => Some(ChannelWrapper::Chat(factory.chat(channel))),
        ChannelKind::StreamedMedia => Some(ChannelWrapper::Call(factory.call(channel))),
        ChannelKind::FileTransfer => {
            Some(ChannelWrapper::FileTransfer(factory.file_transfer(channel)))
        }
        ChannelKind::Tube => None,
    }
}

/// Wait for the wrapper's own readiness step.
///
/// Chats resolve their conversation id; calls resolve the remote contact,
/// which is returned. File transfers are usable right away.
pub async fn wait_wrapper_ready(
    wrapper: &ChannelWrapper,
) -> Result<Option<Contact>, ChannelError> {
    match wrapper {
        ChannelWrapper::Chat(chat) => {
            if !chat.is_ready() {
                chat.wait_ready().await?;
            }
            Ok(None)
        }
        ChannelWrapper::Call(call) => match call.remote_contact() {
            Some(contact) => Ok(Some(contact)),
            None => call.wait_contact().await.map(Some),
        },
        ChannelWrapper::FileTransfer(_) => Ok(None),
    }
}

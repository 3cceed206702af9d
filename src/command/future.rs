use ash::vk;
use crossbeam_channel::{Receiver, Sender, TryRecvError};

pub(crate) type Completion = Result<(), vk::Result>;

pub(crate) fn completion_channel() -> (Sender<Completion>, CommandFuture) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (
        tx,
        CommandFuture {
            receiver: rx,
            result: None,
        },
    )
}

/// Completion of work recorded through `CommandProcessor::async_submit`.
///
/// Resolves once, when `begin_frame` observes the owning fence signaled, and
/// keeps reporting that same result afterwards. There is no blocking wait:
/// resolution only happens while the processor is driven frame by frame.
#[derive(Debug)]
pub struct CommandFuture {
    receiver: Receiver<Completion>,
    result: Option<Completion>,
}

impl CommandFuture {
    /// Non-blocking check for completion.
    pub fn try_result(&mut self) -> Option<Completion> {
        if self.result.is_none() {
            self.result = match self.receiver.try_recv() {
                Ok(result) => Some(result),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("command processor dropped an unresolved future");
                    Some(Err(vk::Result::ERROR_DEVICE_LOST))
                }
            };
        }
        self.result
    }

    pub fn is_resolved(&mut self) -> bool {
        self.try_result().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_once_and_stays_resolved() {
        let (tx, mut future) = completion_channel();
        assert_eq!(future.try_result(), None);

        tx.send(Ok(())).unwrap();
        assert_eq!(future.try_result(), Some(Ok(())));
        assert_eq!(future.try_result(), Some(Ok(())));
    }

    #[test]
    fn dropped_sender_reports_device_lost() {
        let (tx, mut future) = completion_channel();
        drop(tx);
        assert_eq!(future.try_result(), Some(Err(vk::Result::ERROR_DEVICE_LOST)));
    }
}

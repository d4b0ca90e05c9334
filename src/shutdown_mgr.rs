use tokio::sync::broadcast;

/// Stops the request listener. Transfers already in progress are not
/// affected; they run until they finish on their own.
#[derive(Debug)]
pub struct ShutdownManager {
    shutdown: bool,
    receiver: broadcast::Receiver<()>,
    sender: broadcast::Sender<()>,
}

impl ShutdownManager {
    pub fn new(sender: broadcast::Sender<()>) -> ShutdownManager {
        let receiver = sender.subscribe();
        ShutdownManager {
            shutdown: false,
            receiver,
            sender,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Resolves once shutdown has been requested, immediately if it already was.
    pub async fn recv(&mut self) {
        if self.shutdown {
            return;
        }

        let _ = self.receiver.recv().await;
        self.shutdown = true;
    }

    pub fn send(&mut self) {
        self.shutdown = true;
        let _ = self.sender.send(());
    }
}

impl Clone for ShutdownManager {
    fn clone(&self) -> ShutdownManager {
        ShutdownManager {
            shutdown: false,
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_wakes_every_clone() {
        let (sender, _) = broadcast::channel(4);
        let mut first = ShutdownManager::new(sender);
        let mut second = first.clone();

        first.send();
        assert!(first.is_shutdown());

        second.recv().await;
        assert!(second.is_shutdown());
        // A second wait returns straight away.
        second.recv().await;
    }
}

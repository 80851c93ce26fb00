use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::warn;

use lingoq_events::Subscription;

/// Handle to control and join a background drain thread.
#[derive(Debug)]
pub struct DrainHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<u64>>,
}

impl DrainHandle {
    /// Request shutdown, wait for the thread, and return how many messages
    /// it handled. Messages already buffered are handled before it exits.
    pub fn shutdown(mut self) -> u64 {
        let _ = self.shutdown.send(());
        self.join.take().and_then(|j| j.join().ok()).unwrap_or(0)
    }
}

/// Drains a bus subscription on a dedicated OS thread.
///
/// - Handles each message with `handler`; failures are logged, never fatal
/// - Exits on shutdown or when the bus is dropped
#[derive(Debug)]
pub struct EventDrain;

impl EventDrain {
    pub fn spawn<M, H, E>(name: &'static str, sub: Subscription<M>, mut handler: H) -> std::io::Result<DrainHandle>
    where
        M: Send + 'static,
        H: FnMut(M) -> Result<(), E> + Send + 'static,
        E: core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || drain_loop(name, sub, shutdown_rx, &mut handler))?;

        Ok(DrainHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn drain_loop<M, H, E>(name: &'static str, sub: Subscription<M>, shutdown_rx: mpsc::Receiver<()>, handler: &mut H) -> u64
where
    H: FnMut(M) -> Result<(), E>,
    E: core::fmt::Debug,
{
    let tick = Duration::from_millis(250);
    let mut handled = 0u64;
    let mut handle = |msg: M| {
        handled += 1;
        if let Err(err) = handler(msg) {
            warn!(drain = name, error = ?err, "event drain handler failed");
        }
    };

    loop {
        if shutdown_rx.try_recv().is_ok() {
            // Flush what was published before the shutdown request.
            sub.drain().into_iter().for_each(&mut handle);
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(msg) => handle(msg),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingoq_events::{EventBus, InMemoryEventBus};
    use std::sync::{Arc, Mutex};

    #[test]
    fn handles_everything_published_before_shutdown() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let handle = EventDrain::spawn("test-drain", bus.subscribe(), move |n: u32| {
            sink.lock().unwrap().push(n);
            if n == 2 { Err("two") } else { Ok(()) }
        })
        .unwrap();

        for n in 1..=3 {
            bus.publish(n).unwrap();
        }
        assert_eq!(handle.shutdown(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn exits_when_bus_is_dropped() {
        let bus: InMemoryEventBus<u32> = InMemoryEventBus::new();
        let handle = EventDrain::spawn("test-drain", bus.subscribe(), |_n: u32| Ok::<_, ()>(())).unwrap();
        drop(bus);
        assert_eq!(handle.shutdown(), 0);
    }
}

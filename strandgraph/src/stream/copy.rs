use super::pipe::pipe;
use super::reader::StreamReader;
use super::StreamError;

/// Per-child buffer for fan-out copies. One chunk of slack per child keeps
/// peers loosely coupled while still bounding how far any consumer can lag.
const CHILD_BUFFER: usize = 1;

/// Fan `parent` out into `n` independent readers.
///
/// See [`StreamReader::copy`] for the behavioural contract.
pub(super) fn copy<T>(parent: StreamReader<T>, n: usize) -> Vec<StreamReader<T>>
where
    T: Clone + Send + 'static,
{
    if n == 0 {
        // No consumers: drop the parent, releasing its producer.
        return Vec::new();
    }

    let mut readers = Vec::with_capacity(n);
    let mut senders = Vec::with_capacity(n);
    for _ in 0..n {
        let (reader, writer) = pipe::<T>(CHILD_BUFFER);
        readers.push(reader);
        senders.push(Some(writer));
    }

    tokio::spawn(async move {
        let mut parent = parent;
        loop {
            match parent.recv().await {
                // Dropping the writers delivers end-of-stream to children.
                Err(StreamError::Closed) => break,
                Err(err) => {
                    for slot in senders.iter_mut() {
                        if let Some(writer) = slot.take() {
                            writer.send(Err(err.clone())).await;
                        }
                    }
                    break;
                }
                Ok(chunk) => {
                    let mut any_alive = false;
                    for slot in senders.iter_mut() {
                        if let Some(writer) = slot {
                            if writer.send(Ok(chunk.clone())).await {
                                any_alive = true;
                            } else {
                                *slot = None;
                            }
                        }
                    }
                    if !any_alive {
                        parent.close();
                        break;
                    }
                }
            }
        }
    });

    readers
}

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

/// Fan-in over a fixed set of bounded channels.
///
/// Yields `(key, item)` as soon as any input has an item ready. Inputs are
/// polled round-robin starting after the one that produced last, so a busy
/// channel cannot starve a quiet one. An input is dropped once it is closed
/// and drained; the stream ends when no input is left.
///
/// Items of one input keep their order. Items of different inputs are
/// ordered only by readiness.
pub struct FanIn<K, T> {
    inputs: Vec<(K, mpsc::Receiver<T>)>,
    cursor: usize,
}

impl<K: Copy, T> FanIn<K, T> {
    pub fn new(inputs: Vec<(K, mpsc::Receiver<T>)>) -> Self {
        Self { inputs, cursor: 0 }
    }

    /// Number of inputs still open.
    pub fn open(&self) -> usize {
        self.inputs.len()
    }

    fn poll_inputs(&mut self, cx: &mut Context<'_>) -> Poll<Option<(K, T)>> {
        let mut checked = 0;
        while checked < self.inputs.len() {
            let index = self.cursor % self.inputs.len();
            let Some((key, rx)) = self.inputs.get_mut(index) else {
                break;
            };
            match rx.poll_recv(cx) {
                Poll::Ready(Some(item)) => {
                    let key = *key;
                    self.cursor = index + 1;
                    return Poll::Ready(Some((key, item)));
                }
                Poll::Ready(None) => {
                    self.inputs.remove(index);
                    // the next input slid into `index`
                    self.cursor = index;
                }
                Poll::Pending => {
                    self.cursor = index + 1;
                    checked += 1;
                }
            }
        }

        if self.inputs.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

impl<K: Copy + Unpin, T> Stream for FanIn<K, T> {
    type Item = (K, T);

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_inputs(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test]
    async fn yields_from_all_inputs_and_ends() {
        let (a_tx, a_rx) = mpsc::channel(4);
        let (b_tx, b_rx) = mpsc::channel(4);
        a_tx.send(1).await.unwrap();
        a_tx.send(2).await.unwrap();
        b_tx.send(10).await.unwrap();
        drop(a_tx);
        drop(b_tx);

        let items: Vec<_> = FanIn::new(vec![('a', a_rx), ('b', b_rx)]).collect().await;
        let a: Vec<_> = items.iter().filter(|(k, _)| *k == 'a').map(|(_, v)| *v).collect();
        let b: Vec<_> = items.iter().filter(|(k, _)| *k == 'b').map(|(_, v)| *v).collect();
        assert_eq!(a, [1, 2]);
        assert_eq!(b, [10]);
    }

    #[tokio::test]
    async fn round_robin_does_not_starve() {
        let (a_tx, a_rx) = mpsc::channel(8);
        let (b_tx, b_rx) = mpsc::channel(8);
        for i in 0..4 {
            a_tx.send(i).await.unwrap();
        }
        b_tx.send(100).await.unwrap();

        let mut fan_in = FanIn::new(vec![('a', a_rx), ('b', b_rx)]);
        let first = fan_in.next().await.unwrap();
        let second = fan_in.next().await.unwrap();
        assert_eq!(first, ('a', 0));
        assert_eq!(second, ('b', 100));
    }

    #[tokio::test]
    async fn closed_input_is_removed_while_other_stays_open() {
        let (a_tx, a_rx) = mpsc::channel::<u8>(1);
        let (b_tx, b_rx) = mpsc::channel::<u8>(1);
        drop(a_tx);

        let mut fan_in = FanIn::new(vec![('a', a_rx), ('b', b_rx)]);
        b_tx.send(7).await.unwrap();
        assert_eq!(fan_in.next().await, Some(('b', 7)));
        assert_eq!(fan_in.open(), 1);

        drop(b_tx);
        assert_eq!(fan_in.next().await, None);
        assert_eq!(fan_in.open(), 0);
    }
}

//! Assertions over block monitor streams.
//!
//! All macros wait at most `timeout = N` seconds (default 5) for the next item.

/// Asserts the next stream item is the block at `height`, or the given error kind.
///
/// ```ignore
/// assert_next!(stream, height = 10);
/// assert_next!(stream, Err(Error::SubscriptionClosed));
/// ```
#[macro_export]
macro_rules! assert_next {
    ($stream: expr, Err($expected_err:expr)) => {
        $crate::assert_next!($stream, Err($expected_err), timeout = 5)
    };
    ($stream: expr, Err($expected_err:expr), timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        let expected = $expected_err;
        match message {
            std::option::Option::Some(std::result::Result::Err(err)) => {
                assert_eq!(err, expected, "Expected error {:?}, got {:?}", expected, err);
            }
            std::option::Option::Some(std::result::Result::Ok(block)) => {
                panic!("Expected error {:?}, got block {}", expected, block.height);
            }
            std::option::Option::None => {
                panic!("Expected error {:?}, but channel was closed", expected);
            }
        }
    };
    ($stream: expr, height = $height: expr) => {
        $crate::assert_next!($stream, height = $height, timeout = 5)
    };
    ($stream: expr, height = $height: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        let expected: u64 = $height;
        match message {
            std::option::Option::Some(std::result::Result::Ok(block)) => {
                assert_eq!(block.height, expected, "Expected block {}, got {}", expected, block.height);
            }
            std::option::Option::Some(std::result::Result::Err(e)) => {
                panic!("Expected block {}, got Err({:?})", expected, e);
            }
            std::option::Option::None => {
                panic!("Expected block {}, but channel was closed", expected);
            }
        }
    };
}

/// Asserts the stream yields exactly the blocks in `range`, in order.
#[macro_export]
macro_rules! assert_next_heights {
    ($stream: expr, $range: expr) => {
        for height in $range {
            $crate::assert_next!($stream, height = height);
        }
    };
}

/// Asserts the stream has ended.
#[macro_export]
macro_rules! assert_closed {
    ($stream: expr) => {
        $crate::assert_closed!($stream, timeout = 5)
    };
    ($stream: expr, timeout = $secs: expr) => {
        let message = tokio::time::timeout(
            std::time::Duration::from_secs($secs),
            tokio_stream::StreamExt::next(&mut $stream),
        )
        .await
        .expect("timed out");
        assert!(message.is_none(), "Expected a closed stream, got {:?}", message)
    };
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    use crate::{
        Error,
        test_utils::MockHeader,
        types::{BlockNotification, MonitorResult},
    };

    fn block(height: u64) -> MonitorResult<MockHeader> {
        let header = MockHeader::new(height, vec![]);
        Ok(BlockNotification { height, hash: header.hash.clone(), header, receipts: None })
    }

    #[tokio::test]
    async fn heights_then_error_then_close() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = ReceiverStream::new(rx);

        for height in 3..=5 {
            tx.send(block(height)).await.unwrap();
        }
        tx.send(Err(Error::SubscriptionClosed)).await.unwrap();
        drop(tx);

        assert_next_heights!(stream, 3..=5);
        assert_next!(stream, Err(Error::SubscriptionClosed));
        assert_closed!(stream);
    }

    #[tokio::test]
    #[should_panic = "Expected block 4, got 3"]
    async fn wrong_height_panics() {
        let (tx, rx) = mpsc::channel(1);
        let mut stream = ReceiverStream::new(rx);
        tx.send(block(3)).await.unwrap();

        assert_next!(stream, height = 4);
    }
}

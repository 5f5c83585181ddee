//! New-head subscription by HTTP block polling

use super::ChainClient;

use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Poll `block_number` and yield every change of the chain head.
///
/// A lower number than the previous head is yielded as well; the consumer
/// treats it as a re-org signal rather than dropping it.
pub fn poll_new_heads(
    client: Arc<dyn ChainClient>,
    poll_interval: Duration,
) -> BoxStream<'static, u64> {
    futures::stream::unfold((client, None::<u64>), move |(client, last)| async move {
        loop {
            match client.block_number().await {
                Ok(head) if Some(head) != last => {
                    debug!("Chain {}: new head {}", client.chain_id(), head);
                    return Some((head, (client, Some(head))));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Failed to get block number for chain {}: {}",
                        client.chain_id(),
                        e
                    );
                }
            }

            tokio::time::sleep(poll_interval).await;
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeChain;

    #[tokio::test]
    async fn test_yields_only_head_changes() {
        let chain = Arc::new(FakeChain::new(1));
        chain.set_head(10);

        let mut heads = poll_new_heads(chain.clone(), Duration::from_millis(5));
        assert_eq!(heads.next().await, Some(10));

        chain.set_head(11);
        assert_eq!(heads.next().await, Some(11));

        chain.set_head(9);
        assert_eq!(heads.next().await, Some(9));
    }
}

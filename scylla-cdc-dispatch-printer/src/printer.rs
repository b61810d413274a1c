use async_trait::async_trait;
use scylla_cdc_dispatch::consumer::{Consumer, ConsumerFactory, RawChange};

pub struct PrinterConsumer;

#[async_trait]
impl Consumer for PrinterConsumer {
    async fn consume_cdc(&mut self, change: RawChange) -> anyhow::Result<()> {
        println!(
            "stream: {}, time: {}, batch_seq_no: {}, end_of_batch: {}, operation: {}, ttl: {:?}",
            change.stream_id,
            change.time,
            change.batch_seq_no,
            change.end_of_batch,
            change.operation,
            change.ttl
        );
        Ok(())
    }
}

pub struct PrinterConsumerFactory;

#[async_trait]
impl ConsumerFactory for PrinterConsumerFactory {
    async fn new_consumer(&self) -> Box<dyn Consumer> {
        Box::new(PrinterConsumer)
    }
}

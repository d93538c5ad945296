// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Drives consumption of every queue in the exchange catalogue. Each queue
//! gets its own consume task; deliveries of one queue are dispatched in
//! order on that task, and deliveries of different queues run concurrently.
//!
//! Shutdown cancels every consumer at the broker, lets the delivery in
//! flight on each task finish, then returns. Both `shutdown` and
//! `consume_blocking` wait on the same running-task counter, so either one
//! returning means no consume task is left.

use crate::{
    consumer::{consume, DeliveryContext},
    errors::AmqpError,
    exchange::ExchangeCatalog,
    publisher::Publisher,
    registry::HandlerRegistry,
    transport::{AmqpTransport, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumption lifecycle of a dispatcher.
#[async_trait]
pub trait Dispatcher {
    /// Opens a consumer on every queue and returns once they are running.
    /// Calling it while already consuming does nothing.
    async fn start_consuming(&self) -> Result<(), AmqpError>;

    /// Starts consuming, then waits until every consumer has stopped.
    async fn consume_blocking(&self) -> Result<(), AmqpError>;

    /// Stops every consumer and waits for in-flight deliveries to finish.
    async fn shutdown(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the `Dispatcher` trait.
pub struct RabbitMQDispatcher {
    defs: Arc<DeliveryContext>,
    consuming: AtomicBool,
    shutdown: watch::Sender<bool>,
    running: Arc<watch::Sender<usize>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// An open consumer not yet handed to its task.
struct QueueConsumer {
    queue: String,
    consumer_tag: String,
    stream: DeliveryStream,
}

/// Counts a consume task as running until dropped, including on panic.
struct RunningTask(Arc<watch::Sender<usize>>);

impl RunningTask {
    fn enter(running: &Arc<watch::Sender<usize>>) -> RunningTask {
        running.send_modify(|count| *count += 1);
        RunningTask(running.clone())
    }
}

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// Logs a warning for every routing key that has handlers but is bound by
    /// no queue of the catalogue, since such handlers can never run.
    ///
    /// # Parameters
    /// * `transport` - Transport used to consume and acknowledge deliveries
    /// * `catalog` - Declared exchanges; every one of their queues is consumed
    /// * `registry` - Handlers per routing key
    /// * `publisher` - Publisher used to send failed messages to a delay queue
    ///
    /// # Returns
    /// A dispatcher that is not consuming yet
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        catalog: Arc<ExchangeCatalog>,
        registry: Arc<HandlerRegistry>,
        publisher: Arc<dyn Publisher>,
    ) -> RabbitMQDispatcher {
        for key in registry.routing_keys() {
            let bound = catalog
                .queues()
                .any(|queue| queue.binding_keys().contains(&key));
            if !bound {
                warn!(
                    routing_key = key,
                    "handlers registered for an unbound routing key"
                );
            }
        }

        RabbitMQDispatcher {
            defs: Arc::new(DeliveryContext {
                transport,
                registry,
                catalog,
                publisher,
            }),
            consuming: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
            running: Arc::new(watch::channel(0).0),
            tasks: Mutex::new(vec![]),
        }
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::SeqCst)
    }

    /// Opens one consumer per queue. On failure the consumers already opened
    /// are cancelled before the error is returned.
    async fn open_consumers(&self) -> Result<Vec<QueueConsumer>, AmqpError> {
        let mut consumers: Vec<QueueConsumer> = vec![];

        for queue in self.defs.catalog.queues() {
            let consumer_tag = format!("{}-{}", queue.name(), Uuid::new_v4());

            match self.defs.transport.consume(queue.name(), &consumer_tag).await {
                Ok(stream) => consumers.push(QueueConsumer {
                    queue: queue.name().to_owned(),
                    consumer_tag,
                    stream,
                }),
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = queue.name(),
                        "failure to create the consumer"
                    );
                    let opened_tags: Vec<String> = consumers
                        .iter()
                        .map(|opened| opened.consumer_tag.clone())
                        .collect();
                    for consumer_tag in &opened_tags {
                        cancel(&self.defs, consumer_tag).await;
                    }
                    return Err(err);
                }
            }
        }

        Ok(consumers)
    }

    /// Waits until no consume task is running, then reaps their handles.
    async fn drain(&self) -> Result<(), AmqpError> {
        let mut running = self.running.subscribe();
        let drained = running.wait_for(|count| *count == 0).await.is_ok();
        if !drained {
            error!("running consumers counter closed");
            return Err(AmqpError::InternalError);
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);

        let mut result = Ok(());
        for res in join_all(tasks).await {
            if let Err(err) = res {
                error!(error = err.to_string(), "tokio process error");
                result = Err(AmqpError::InternalError);
            }
        }

        result
    }
}

#[async_trait]
impl Dispatcher for RabbitMQDispatcher {
    async fn start_consuming(&self) -> Result<(), AmqpError> {
        // held for the whole startup so a concurrent shutdown sees every task
        let mut tasks = self.tasks.lock().await;

        if self
            .consuming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("dispatcher already consuming");
            return Ok(());
        }

        let consumers = match self.open_consumers().await {
            Ok(consumers) => consumers,
            Err(err) => {
                self.consuming.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        for consumer in consumers {
            let running = RunningTask::enter(&self.running);
            tasks.push(tokio::spawn(consume_queue(
                consumer,
                self.defs.clone(),
                self.shutdown.subscribe(),
                running,
            )));
        }

        info!(queues = tasks.len(), "consuming");

        Ok(())
    }

    async fn consume_blocking(&self) -> Result<(), AmqpError> {
        self.start_consuming().await?;

        let result = self.drain().await;
        self.consuming.store(false, Ordering::SeqCst);

        result
    }

    async fn shutdown(&self) -> Result<(), AmqpError> {
        {
            let _tasks = self.tasks.lock().await;
            if !self.is_consuming() {
                return Ok(());
            }

            info!("shutting down consumers");
            self.shutdown.send_replace(true);
        }

        let result = self.drain().await;

        self.shutdown.send_replace(false);
        self.consuming.store(false, Ordering::SeqCst);

        result
    }
}

async fn cancel(defs: &DeliveryContext, consumer_tag: &str) {
    if let Err(err) = defs.transport.cancel(consumer_tag).await {
        warn!(
            error = err.to_string(),
            consumer_tag, "failure to cancel the consumer"
        );
    }
}

async fn consume_queue(
    consumer: QueueConsumer,
    defs: Arc<DeliveryContext>,
    mut shutdown: watch::Receiver<bool>,
    _running: RunningTask,
) {
    let QueueConsumer {
        queue,
        consumer_tag,
        mut stream,
    } = consumer;
    let tracer = global::tracer("amqp consumer");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                cancel(&defs, &consumer_tag).await;
                debug!(queue = %queue, "consumer stopped");
                break;
            }

            next = stream.next() => match next {
                Some(Ok(delivery)) => match consume(&tracer, &delivery, &defs).await {
                    Ok(outcome) => debug!(?outcome, "delivery dispatched"),
                    Err(err) => error!(error = err.to_string(), "error consume msg"),
                },
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => {
                    warn!(queue = %queue, "consumer stream closed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        exchange::ExchangeDefinition,
        handler::{ConsumerHandler, ConsumerMessage, MessageHandler},
        publisher::RabbitMQPublisher,
        queue::QueueDefinition,
        transport::{DeliveredMessage, MockAmqpTransport},
    };
    use futures_util::stream;
    use mockall::predicate::eq;
    use opentelemetry::Context;
    use std::{sync::atomic::AtomicBool, time::Duration};
    use tokio::sync::mpsc;

    struct Forward {
        sender: mpsc::UnboundedSender<String>,
    }

    impl MessageHandler for Forward {
        fn handle(&self, msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.sender
                .send(msg.body.clone())
                .map_err(|err| HandlerError::failed(err.to_string()))
        }
    }

    fn catalog() -> Arc<ExchangeCatalog> {
        Arc::new(
            ExchangeCatalog::new(vec![
                ExchangeDefinition::new("orders")
                    .dead_letter_exchange("orders.dlx")
                    .queue(QueueDefinition::new("orders.created").routing_key("order.created")),
                ExchangeDefinition::new("payments")
                    .queue(QueueDefinition::new("payments.settled")),
            ])
            .unwrap(),
        )
    }

    fn dispatcher(transport: MockAmqpTransport, registry: HandlerRegistry) -> RabbitMQDispatcher {
        let transport: Arc<dyn AmqpTransport> = Arc::new(transport);
        let catalog = catalog();
        let publisher = RabbitMQPublisher::new(transport.clone(), catalog.clone());

        RabbitMQDispatcher::new(transport, catalog, Arc::new(registry), publisher)
    }

    fn pending() -> DeliveryStream {
        stream::pending::<Result<DeliveredMessage, AmqpError>>().boxed()
    }

    fn order_created(delivery_tag: u64) -> DeliveryStream {
        let delivery = DeliveredMessage {
            delivery_tag,
            exchange: "orders".to_owned(),
            routing_key: "order.created".to_owned(),
            data: b"{\"id\":1}".to_vec(),
            ..DeliveredMessage::default()
        };

        stream::iter(vec![Ok(delivery)]).chain(pending()).boxed()
    }

    struct SlowHandler {
        started: mpsc::UnboundedSender<()>,
        done: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConsumerHandler for SlowHandler {
        async fn exec(&self, _: &Context, _: &ConsumerMessage) -> Result<(), HandlerError> {
            let _ = self.started.send(());
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_consuming_is_idempotent() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .withf(|queue, tag| {
                queue == "orders.created" && tag.starts_with("orders.created-")
            })
            .times(1)
            .returning(|_, _| Ok(pending()));
        transport
            .expect_consume()
            .withf(|queue, _| queue == "payments.settled")
            .times(1)
            .returning(|_, _| Ok(pending()));
        transport
            .expect_cancel()
            .times(2)
            .returning(|_| Ok(()));

        let dispatcher = dispatcher(transport, HandlerRegistry::builder().build().unwrap());

        assert_eq!(dispatcher.start_consuming().await, Ok(()));
        assert_eq!(dispatcher.start_consuming().await, Ok(()));
        assert!(dispatcher.is_consuming());

        assert_eq!(dispatcher.shutdown().await, Ok(()));
        assert!(!dispatcher.is_consuming());
    }

    #[tokio::test]
    async fn consumer_failure_leaves_dispatcher_stopped() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .times(1)
            .returning(|queue, _| Err(AmqpError::BindingConsumerError(queue.to_owned())));

        let dispatcher = dispatcher(transport, HandlerRegistry::builder().build().unwrap());

        assert_eq!(
            dispatcher.start_consuming().await,
            Err(AmqpError::BindingConsumerError("orders.created".to_owned()))
        );
        assert!(!dispatcher.is_consuming());
    }

    #[tokio::test]
    async fn consumers_opened_before_a_failure_are_cancelled() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .withf(|queue, _| queue == "orders.created")
            .times(1)
            .returning(|_, _| Ok(pending()));
        transport
            .expect_consume()
            .withf(|queue, _| queue == "payments.settled")
            .times(1)
            .returning(|queue, _| Err(AmqpError::BindingConsumerError(queue.to_owned())));
        transport
            .expect_cancel()
            .withf(|tag| tag.starts_with("orders.created-"))
            .times(1)
            .returning(|_| Ok(()));

        let dispatcher = dispatcher(transport, HandlerRegistry::builder().build().unwrap());

        assert_eq!(
            dispatcher.start_consuming().await,
            Err(AmqpError::BindingConsumerError("payments.settled".to_owned()))
        );
        assert!(!dispatcher.is_consuming());
    }

    #[tokio::test]
    async fn deliveries_are_dispatched_and_acked() {
        let (sender, mut received) = mpsc::unbounded_channel();

        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .withf(|queue, _| queue == "orders.created")
            .returning(|_, _| Ok(order_created(7)));
        transport
            .expect_consume()
            .withf(|queue, _| queue == "payments.settled")
            .returning(|_, _| Ok(pending()));
        transport
            .expect_acknowledge()
            .with(eq(7), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        transport
            .expect_cancel()
            .times(2)
            .returning(|_| Ok(()));

        let registry = HandlerRegistry::builder()
            .route::<Forward>(&["order.created"])
            .handler(Forward { sender })
            .build()
            .unwrap();
        let dispatcher = dispatcher(transport, registry);

        dispatcher.start_consuming().await.unwrap();

        let body = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap();
        assert_eq!(body.as_deref(), Some("{\"id\":1}"));

        assert_eq!(dispatcher.shutdown().await, Ok(()));
    }

    #[tokio::test]
    async fn consume_blocking_returns_once_every_stream_ends() {
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .times(2)
            .returning(|_, _| {
                Ok(stream::empty::<Result<DeliveredMessage, AmqpError>>().boxed())
            });
        transport.expect_cancel().never();

        let dispatcher = dispatcher(transport, HandlerRegistry::builder().build().unwrap());

        assert_eq!(dispatcher.consume_blocking().await, Ok(()));
        assert!(!dispatcher.is_consuming());
    }

    #[tokio::test]
    async fn shutdown_during_consume_blocking_waits_for_in_flight_handler() {
        let (started, mut handler_started) = mpsc::unbounded_channel();
        let done = Arc::new(AtomicBool::new(false));

        let mut transport = MockAmqpTransport::new();
        transport
            .expect_consume()
            .withf(|queue, _| queue == "orders.created")
            .returning(|_, _| Ok(order_created(9)));
        transport
            .expect_consume()
            .withf(|queue, _| queue == "payments.settled")
            .returning(|_, _| Ok(pending()));
        transport
            .expect_acknowledge()
            .with(eq(9), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        transport
            .expect_cancel()
            .times(2)
            .returning(|_| Ok(()));

        let registry = HandlerRegistry::builder()
            .route::<SlowHandler>(&["order.created"])
            .async_handler(SlowHandler {
                started,
                done: done.clone(),
            })
            .build()
            .unwrap();
        let dispatcher = Arc::new(dispatcher(transport, registry));

        let blocking = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.consume_blocking().await }
        });

        tokio::time::timeout(Duration::from_secs(5), handler_started.recv())
            .await
            .unwrap();

        assert_eq!(dispatcher.shutdown().await, Ok(()));
        assert!(done.load(Ordering::SeqCst));
        assert!(!dispatcher.is_consuming());

        let blocking = tokio::time::timeout(Duration::from_secs(5), blocking)
            .await
            .unwrap();
        assert_eq!(blocking.unwrap(), Ok(()));
    }
}

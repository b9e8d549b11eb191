use stackup::mock::MockRuntime;
use stackup::{ControllerConfig, LifecycleController, Service, Topology};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Every event's message with the name of the span it was emitted in.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<(String, Option<&'static str>)>>>);

impl Captured {
    fn span_of(&self, message: &str) -> Vec<Option<&'static str>> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == message)
            .map(|(_, span)| *span)
            .collect()
    }
}

struct Message(String);

impl Visit for Message {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for Captured
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut message = Message(String::new());
        event.record(&mut message);
        let span = ctx.event_span(event).map(|span| span.name());
        self.0.lock().unwrap().push((message.0, span));
    }
}

/// Per-service events from spawned tasks carry the span of the call that spawned them.
#[tokio::test]
async fn test_service_events_are_scoped_to_their_operation() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry().with(captured.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut builder = Topology::builder();
    builder.add_service(Service::new("db", "postgres:15")).unwrap();
    builder
        .add_service(Service::new("bot", "bot:latest").depends_on("db"))
        .unwrap();
    let controller = LifecycleController::new(
        builder.build().unwrap(),
        Arc::new(MockRuntime::new()),
        ControllerConfig::default(),
    );

    assert!(controller.start_all().await.all_ready());
    controller.stop_all().await;

    assert_eq!(captured.span_of("Starting service"), [Some("start_all"); 2]);
    assert_eq!(captured.span_of("Service ready"), [Some("start_all"); 2]);
    assert_eq!(captured.span_of("Service stopped"), [Some("stop_all"); 2]);
}

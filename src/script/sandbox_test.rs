use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::api::database::MemoryDashboardStore;
use crate::context::{ScriptContext, UserInfo};
use crate::runtime::{ConsoleLevel, ScriptRuntime};
use crate::script::ScriptError;
use crate::widget::{Widget, WidgetKind};

fn runtime_with(widgets: Vec<Widget>) -> ScriptRuntime {
    ScriptRuntime::builder(widgets).build().unwrap()
}

fn switch_runtime() -> ScriptRuntime {
    runtime_with(vec![Widget::new("sw1", WidgetKind::Switch)])
}

#[test]
fn script_observes_its_own_write() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            widget::set_value("sw1", true);
            let v = widget::get_value("sw1");
            if v != true {
                throw "read-after-write mismatch";
            }
            "#,
        )
        .unwrap();
    assert_eq!(runtime.widget().get_value("sw1"), Some(json!(true)));
}

#[test]
fn script_handler_fires_on_host_write() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            widget::on("sw1", "on", |v| {
                storage::set("seen", v);
            });
            "#,
        )
        .unwrap();

    runtime.widget().set_value("sw1", json!(true));
    assert_eq!(runtime.storage().get("seen"), Some(json!(true)));
}

#[test]
fn script_once_fires_a_single_time() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            storage::set("count", 0);
            widget::once("sw1", "change", |v| {
                let n = storage::get("count");
                storage::set("count", n + 1);
            });
            "#,
        )
        .unwrap();

    runtime.widget().set_value("sw1", json!(1));
    runtime.widget().set_value("sw1", json!(2));
    assert_eq!(runtime.storage().get("count"), Some(json!(1)));
}

#[test]
fn script_unsubscribe_token_stops_delivery() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            storage::set("count", 0);
            let token = widget::on("sw1", "change", |v| {
                let n = storage::get("count");
                storage::set("count", n + 1);
            });
            widget::unsubscribe(token);
            "#,
        )
        .unwrap();

    runtime.widget().set_value("sw1", json!(1));
    assert_eq!(runtime.storage().get("count"), Some(json!(0)));
}

#[test]
fn script_emit_dispatches_within_the_run() {
    let runtime = runtime_with(vec![Widget::new("w1", WidgetKind::Generic)]);
    runtime
        .execute(
            r#"
            widget::on("w1", "ping", |v| {
                storage::set("ping", v);
            });
            widget::emit("w1", "ping", 5);
            "#,
        )
        .unwrap();
    assert_eq!(runtime.storage().get("ping"), Some(json!(5)));
}

#[test]
fn script_reads_widget_record_and_geometry() {
    let mut gauge = Widget::new("g1", WidgetKind::Gauge);
    gauge.position.x = 30.0;
    let runtime = runtime_with(vec![gauge]);
    runtime
        .execute(
            r#"
            let w = widget::get("g1");
            storage::set("kind", w["type"]);
            let p = widget::get_position("g1");
            storage::set("x", p.x);
            widget::set_rotation("g1", 45.0);
            storage::set("rot", widget::get_rotation("g1"));
            "#,
        )
        .unwrap();

    assert_eq!(runtime.storage().get("kind"), Some(json!("gauge")));
    assert_eq!(runtime.storage().get("x"), Some(json!(30.0)));
    assert_eq!(runtime.storage().get("rot"), Some(json!(45.0)));
}

#[test]
fn script_reads_context_snapshot() {
    let context = ScriptContext {
        user: Some(UserInfo {
            id: Uuid::new_v4(),
            email: "ops@example.com".into(),
            role: "admin".into(),
        }),
        dashboard_id: Some(Uuid::new_v4()),
        viewport: crate::context::Viewport { width: 800, height: 600, touch: true },
    };
    let runtime = ScriptRuntime::builder(Vec::new())
        .context(context)
        .build()
        .unwrap();

    runtime
        .execute(
            r#"
            let user = context::user();
            storage::set("email", user.email);
            let device = context::device();
            storage::set("class", device["type"]);
            storage::set("dash", context::dashboard_id());
            "#,
        )
        .unwrap();

    assert_eq!(runtime.storage().get("email"), Some(json!("ops@example.com")));
    assert_eq!(runtime.storage().get("class"), Some(json!("tablet")));
    assert!(runtime.storage().get("dash").is_some());
}

#[test]
fn compile_error_is_reported_and_sunk() {
    let entries: Arc<Mutex<Vec<(ConsoleLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = entries.clone();
    let runtime = ScriptRuntime::builder(Vec::new())
        .console_sink(Arc::new(move |level, message, _values| {
            sink.lock().push((level, message.to_owned()));
        }))
        .build()
        .unwrap();

    let err = runtime.execute("let x = ;").unwrap_err();
    assert!(matches!(err, ScriptError::Compile(_)));

    let entries = entries.lock();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, ConsoleLevel::Error);
    assert!(entries[0].1.contains("compile error"));
}

#[test]
fn top_level_throw_is_reported_and_sunk() {
    let entries: Arc<Mutex<Vec<(ConsoleLevel, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = entries.clone();
    let runtime = ScriptRuntime::builder(Vec::new())
        .console_sink(Arc::new(move |level, message, _values| {
            sink.lock().push((level, message.to_owned()));
        }))
        .build()
        .unwrap();

    let err = runtime.execute(r#"throw "boom";"#).unwrap_err();
    assert!(matches!(err, ScriptError::Runtime(_)));
    assert!(err.to_string().contains("boom"));
    assert!(entries.lock().iter().any(|(l, m)| *l == ConsoleLevel::Error && m.contains("boom")));
}

#[test]
fn handler_error_is_contained() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            widget::on("sw1", "change", |v| {
                throw "handler bug";
            });
            widget::on("sw1", "change", |v| {
                storage::set("survivor", v);
            });
            "#,
        )
        .unwrap();

    runtime.widget().set_value("sw1", json!(3));
    assert_eq!(runtime.storage().get("survivor"), Some(json!(3)));
}

#[test]
fn console_output_reaches_the_sink() {
    let entries: Arc<Mutex<Vec<(ConsoleLevel, String, Vec<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = entries.clone();
    let runtime = ScriptRuntime::builder(Vec::new())
        .console_sink(Arc::new(move |level, message, values| {
            sink.lock().push((level, message.to_owned(), values.to_vec()));
        }))
        .build()
        .unwrap();

    runtime
        .execute(
            r#"
            console::log("boot", 42);
            console::warn("low battery");
            "#,
        )
        .unwrap();

    let entries = entries.lock();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, ConsoleLevel::Log);
    assert_eq!(entries[0].1, "boot 42");
    assert_eq!(entries[0].2, vec![json!("boot"), json!(42)]);
    assert_eq!(entries[1].0, ConsoleLevel::Warn);
}

#[test]
fn cleanup_silences_script_handlers() {
    let runtime = switch_runtime();
    runtime
        .execute(
            r#"
            widget::on("sw1", "change", |v| {
                storage::set("late", v);
            });
            "#,
        )
        .unwrap();

    runtime.cleanup();
    runtime.widget().set_value("sw1", json!(9));
    assert_eq!(runtime.storage().get("late"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_database_round_trip() {
    let runtime = ScriptRuntime::builder(Vec::new())
        .context(ScriptContext { dashboard_id: Some(Uuid::new_v4()), ..ScriptContext::default() })
        .database(Arc::new(MemoryDashboardStore::new()))
        .build()
        .unwrap();

    runtime
        .execute(
            r#"
            db::save("mode", "eco");
            storage::set("loaded", db::load("mode"));
            storage::set("keys", db::list());
            "#,
        )
        .unwrap();

    assert_eq!(runtime.storage().get("loaded"), Some(json!("eco")));
    assert_eq!(runtime.storage().get("keys"), Some(json!(["mode"])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_database_without_dashboard_id_rejects() {
    let runtime = ScriptRuntime::builder(Vec::new())
        .database(Arc::new(MemoryDashboardStore::new()))
        .build()
        .unwrap();

    runtime
        .execute(
            r#"
            try {
                db::save("k", 1);
                storage::set("err", "no error");
            } catch (e) {
                storage::set("err", e);
            }
            "#,
        )
        .unwrap();

    let err = runtime.storage().get("err").unwrap();
    assert!(err.as_str().unwrap().contains("Dashboard ID"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timer_fires_and_cleanup_aborts_intervals() {
    let runtime = ScriptRuntime::builder(Vec::new()).build().unwrap();
    runtime
        .execute(
            r#"
            storage::set("ticks", 0);
            set_timeout(|| {
                storage::set("fired", true);
            }, 20);
            set_interval(|| {
                let n = storage::get("ticks");
                storage::set("ticks", n + 1);
            }, 25);
            "#,
        )
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(runtime.storage().get("fired"), Some(json!(true)));
    let ticks = runtime.storage().get("ticks").unwrap().as_i64().unwrap();
    assert!(ticks >= 2, "interval should have ticked, saw {ticks}");

    runtime.cleanup();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    let after = runtime.storage().get("ticks").unwrap().as_i64().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    assert_eq!(runtime.storage().get("ticks").unwrap().as_i64().unwrap(), after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_http_error_carries_the_status() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
            .await
            .unwrap();
        socket.shutdown().await.ok();
    });

    let runtime = ScriptRuntime::builder(Vec::new()).build().unwrap();
    let script = format!(
        r#"
        try {{
            http::get("http://{addr}/missing");
            storage::set("err", "no error");
        }} catch (e) {{
            storage::set("err", e);
        }}
        "#
    );
    runtime.execute(&script).unwrap();

    let err = runtime.storage().get("err").unwrap();
    assert!(err.as_str().unwrap().contains("404"), "got: {err}");
}

// ABOUTME: End-to-end environment tests against the in-memory container runtime
// ABOUTME: Covers construction, networking, adding templates, readiness failures, deadlines and teardown

use envforge_config::EngineSettings;
use envforge_engine::{
    ContainerState, EngineError, EnvironmentManager, EnvironmentRequest, EnvironmentState,
    MemoryTemplateLoader, ModelError, TemplateRequest,
};
use envforge_runtime::{FakeRuntime, HttpProbeResponse, RuntimeCall, ENV_LABEL};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REDIS: &str = r#"
    fn info() {
        #{
            "description": "Redis cache",
            "version": "7",
            "parameters": #{
                "name": #{ "type": "string", "default": "cache" },
                "port": #{ "type": "number", "default": 6379 }
            }
        }
    }

    fn execute(tpl, params) {
        let c = tpl.FetchImage("redis:7").NewContainer(params.name);
        c.SetPorts(params.port);
        c.SetLabel("role", "cache");
        c.AddReadinessCheck("net", #{
            "address": "{{.ExternalAddress}}:{{.Self.ExposedPort 6379}}",
            "retry_limit": 5,
            "retry_interval": "10ms"
        });
    }
"#;

const WEB: &str = r#"
    fn execute(tpl, params) {
        let c = tpl.FetchImage("nginx:1.25").NewContainer("web");
        c.SetPorts(80);
        c.SetEnv("CACHE_ADDR", "{{.ExternalAddress}}:{{(.ContainerWithLabel \"role\" \"cache\").ExposedPort 6379}}");
        c.AddReadinessCheck("http", #{
            "url": "http://{{.ExternalAddress}}:{{.Self.ExposedPort 80}}/",
            "codes": [200],
            "retry_limit": 3,
            "retry_interval": "10ms"
        });
    }
"#;

const STACK: &str = r#"
    fn execute(tpl, params) {
        tpl.Import("redis", #{ "name": "cache-a" });
        tpl.Import("redis", #{ "name": "cache-b" });
        tpl.FetchImage("alpine:3").NewContainer("worker");
    }
"#;

const SUITE: &str = r#"
    fn execute(tpl, params) {
        tpl.Import("redis");
        tpl.Import("web");
        tpl.FetchImage("alpine:3").NewContainer("runner");
    }
"#;

const SLUGGISH: &str = r#"
    fn execute(tpl, params) {
        let c = tpl.FetchImage("postgres:16").NewContainer("db");
        c.SetPorts(5432);
        c.AddReadinessCheck("net", #{
            "address": "{{.ExternalAddress}}:{{.Self.ExposedPort 5432}}",
            "retry_limit": 1000,
            "retry_interval": "10ms"
        });
    }
"#;

const APP: &str = r#"
    fn execute(tpl, params) {
        let img = tpl.BuildImage("api");
        img.CopyDataToWorkspace("ws");
        img.InterpolateWorkspaceFile("ws/config.yml", #{ "port": params.port });
        let c = img.NewContainer("api");
        c.SetPorts(params.port);
    }
"#;

fn settings() -> EngineSettings {
    EngineSettings {
        external_address: "127.0.0.1".to_string(),
        port_range_min: 42000,
        port_range_max: 42999,
        build_timeout_secs: 30,
        ..EngineSettings::default()
    }
}

fn loader() -> MemoryTemplateLoader {
    MemoryTemplateLoader::new()
        .with_template("redis", REDIS)
        .with_template("web", WEB)
        .with_template("stack", STACK)
        .with_template("suite", SUITE)
        .with_template("sluggish", SLUGGISH)
        .with_template("app", APP)
        .with_data("app", "ws/Dockerfile", "FROM alpine")
        .with_data("app", "ws/config.yml", "listen: {{.port}}")
}

fn manager_with(settings: EngineSettings, runtime: &FakeRuntime) -> EnvironmentManager {
    EnvironmentManager::new(settings, Arc::new(runtime.clone()), Arc::new(loader()))
        .expect("valid settings")
}

fn manager(runtime: &FakeRuntime) -> EnvironmentManager {
    manager_with(settings(), runtime)
}

fn targets(calls: Vec<RuntimeCall>) -> Vec<String> {
    calls
        .into_iter()
        .map(|call| call.target().to_string())
        .collect()
}

fn sorted(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items
}

#[tokio::test]
async fn test_environment_becomes_ready() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(
            EnvironmentRequest::new("itest")
                .with_template("redis", json!({}))
                .with_template("web", json!({})),
        )
        .await
        .unwrap();

    assert_eq!(env.state().await, EnvironmentState::Ready);
    assert!(env.id().starts_with("itest-"));

    let readiness = env.container_readiness().await;
    assert_eq!(readiness["cache"], ContainerState::Ready);
    assert_eq!(readiness["web"], ContainerState::Ready);

    assert_eq!(
        sorted(targets(runtime.calls_of("fetch_image"))),
        vec!["nginx:1.25", "redis:7"]
    );
    assert_eq!(runtime.calls_of("start_container").len(), 2);

    let specs = runtime.created_specs();
    let cache = specs.iter().find(|s| s.hostname == "cache").unwrap();
    let web = specs.iter().find(|s| s.hostname == "web").unwrap();
    assert_eq!(cache.name, format!("{}-cache", env.id()));
    assert_eq!(cache.labels[ENV_LABEL], env.id());
    assert_eq!(
        web.env["CACHE_ADDR"],
        format!("127.0.0.1:{}", cache.ports[&6379])
    );
    assert!((42000..=42999).contains(&web.ports[&80]));
    assert_ne!(web.ports[&80], cache.ports[&6379]);
}

#[tokio::test]
async fn test_export_groups_containers_by_template_instance() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("stack").with_template("stack", json!({})))
        .await
        .unwrap();

    let export = env.export().await;
    assert_eq!(export.state, EnvironmentState::Ready);
    assert_eq!(
        export.templates.keys().cloned().collect::<Vec<_>>(),
        vec!["redis", "stack"]
    );

    let redis = &export.templates["redis"];
    assert_eq!(
        redis.iter().map(|i| i.instance.as_str()).collect::<Vec<_>>(),
        vec!["0.0", "0.1"]
    );
    let cache_b = &redis[1].containers["cache-b"];
    assert_eq!(cache_b.hostname, "cache-b");
    assert_eq!(cache_b.id, Some(format!("{}-cache-b", env.id())));
    assert!(cache_b.ports[&6379].starts_with("127.0.0.1:"));

    assert!(export.templates["stack"][0].containers.contains_key("worker"));

    let json = serde_json::to_value(&export).unwrap();
    assert_eq!(json["state"], "ready");
    assert_eq!(json["templates"]["stack"][0]["instance"], "0");
}

#[tokio::test]
async fn test_importing_siblings_merges_all_containers() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("suite").with_template("suite", json!({})))
        .await
        .unwrap();

    let readiness = env.container_readiness().await;
    assert_eq!(
        readiness.keys().cloned().collect::<Vec<_>>(),
        vec!["cache", "runner", "web"]
    );
    assert!(readiness.values().all(|s| *s == ContainerState::Ready));

    let export = env.export().await;
    assert_eq!(
        export.templates.keys().cloned().collect::<Vec<_>>(),
        vec!["redis", "suite", "web"]
    );
    assert_eq!(export.templates["web"][0].instance, "0.1");
    assert_eq!(runtime.created_specs().len(), 3);
}

#[tokio::test]
async fn test_containers_share_an_environment_network() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("net").with_template("stack", json!({})))
        .await
        .unwrap();
    let network = format!("envforge-{}", env.id());

    assert_eq!(targets(runtime.calls_of("create_network")), vec![network.clone()]);
    let specs = runtime.created_specs();
    assert_eq!(specs.len(), 3);
    assert!(specs.iter().all(|s| s.network.as_deref() == Some(network.as_str())));

    manager.terminate(env.id()).await.unwrap();
    assert_eq!(targets(runtime.calls_of("remove_network")), vec![network]);
}

#[tokio::test]
async fn test_portless_container_exposes_image_ports() {
    let runtime = FakeRuntime::new();
    runtime.expose_image_ports("alpine:3", &[8080]);
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("exposed").with_template("stack", json!({})))
        .await
        .unwrap();

    assert_eq!(targets(runtime.calls_of("image_ports")), vec!["alpine:3"]);

    let specs = runtime.created_specs();
    let worker = specs.iter().find(|s| s.hostname == "worker").unwrap();
    assert_eq!(worker.ports.len(), 1);
    assert!((42000..=42999).contains(&worker.ports[&8080]));

    let cache_a = specs.iter().find(|s| s.hostname == "cache-a").unwrap();
    assert_eq!(cache_a.ports.keys().copied().collect::<Vec<_>>(), vec![6379]);

    let export = env.export().await;
    let exported = &export.templates["stack"][0].containers["worker"];
    assert_eq!(
        exported.ports[&8080],
        format!("127.0.0.1:{}", worker.ports[&8080])
    );
    assert_eq!(manager.port_pool().leased(), 3);
}

#[tokio::test]
async fn test_apply_templates_starts_only_new_containers() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("grow").with_template("redis", json!({})))
        .await
        .unwrap();

    let export = manager
        .apply_templates(env.id(), vec![TemplateRequest::new("web", json!({}))])
        .await
        .unwrap();

    assert_eq!(export.state, EnvironmentState::Ready);
    assert_eq!(
        export.templates.keys().cloned().collect::<Vec<_>>(),
        vec!["redis", "web"]
    );

    assert_eq!(
        targets(runtime.calls_of("start_container")),
        vec![format!("{}-cache", env.id()), format!("{}-web", env.id())]
    );
    assert_eq!(runtime.calls_of("create_network").len(), 1);

    let specs = runtime.created_specs();
    let cache = specs.iter().find(|s| s.hostname == "cache").unwrap();
    let web = specs.iter().find(|s| s.hostname == "web").unwrap();
    assert_eq!(
        web.env["CACHE_ADDR"],
        format!("127.0.0.1:{}", cache.ports[&6379])
    );

    let readiness = env.container_readiness().await;
    assert_eq!(readiness["cache"], ContainerState::Ready);
    assert_eq!(readiness["web"], ContainerState::Ready);
    assert_eq!(manager.port_pool().leased(), 2);

    manager.terminate(env.id()).await.unwrap();
    assert_eq!(runtime.calls_of("remove_container").len(), 2);
    assert_eq!(manager.port_pool().leased(), 0);
}

#[tokio::test]
async fn test_apply_templates_rejects_duplicate_names() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("dup").with_template("redis", json!({})))
        .await
        .unwrap();
    let before = runtime.calls().len();

    let result = manager
        .apply_templates(env.id(), vec![TemplateRequest::new("redis", json!({}))])
        .await;

    assert!(matches!(
        result,
        Err(EngineError::Model(ModelError::DuplicateContainer { ref name, .. })) if name == "cache"
    ));
    assert_eq!(runtime.calls().len(), before);
    assert_eq!(env.state().await, EnvironmentState::Ready);
    assert_eq!(manager.port_pool().leased(), 1);
}

#[tokio::test]
async fn test_failed_apply_keeps_existing_containers() {
    let runtime = FakeRuntime::new();
    runtime.on_http(|_| Ok(HttpProbeResponse::new(500, "boom")));
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("rollback").with_template("redis", json!({})))
        .await
        .unwrap();

    let result = manager
        .apply_templates(env.id(), vec![TemplateRequest::new("web", json!({}))])
        .await;
    assert!(matches!(result, Err(EngineError::Readiness(_))));

    let web = format!("{}-web", env.id());
    assert_eq!(targets(runtime.calls_of("stop_container")), vec![web.clone()]);
    assert_eq!(targets(runtime.calls_of("remove_container")), vec![web]);
    assert!(runtime.calls_of("remove_network").is_empty());

    assert_eq!(env.state().await, EnvironmentState::Ready);
    assert_eq!(manager.port_pool().leased(), 1);
    assert_eq!(
        env.container_readiness().await.keys().cloned().collect::<Vec<_>>(),
        vec!["cache"]
    );
    assert_eq!(
        env.export().await.templates.keys().cloned().collect::<Vec<_>>(),
        vec!["redis"]
    );

    let export = manager
        .apply_templates(env.id(), vec![TemplateRequest::new("stack", json!({}))])
        .await
        .unwrap();
    assert!(export.templates.contains_key("stack"));
}

#[tokio::test]
async fn test_duplicate_container_fails_before_runtime_calls() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let result = manager
        .create(
            EnvironmentRequest::new("dup")
                .with_template("redis", json!({}))
                .with_template("redis", json!({})),
        )
        .await;

    assert!(matches!(
        result,
        Err(EngineError::Model(ModelError::DuplicateContainer { ref name, .. })) if name == "cache"
    ));
    assert!(runtime.calls().is_empty());
    assert!(manager.list().await.is_empty());
    assert_eq!(manager.port_pool().leased(), 0);
}

#[tokio::test]
async fn test_same_template_twice_gets_separate_instances() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(
            EnvironmentRequest::new("twice")
                .with_template("redis", json!({ "name": "primary" }))
                .with_template("redis", json!({ "name": "replica" })),
        )
        .await
        .unwrap();

    let export = env.export().await;
    let instances: Vec<&str> = export.templates["redis"]
        .iter()
        .map(|i| i.instance.as_str())
        .collect();
    assert_eq!(instances, vec!["0", "1"]);
    assert_eq!(runtime.calls_of("fetch_image").len(), 1);
}

#[tokio::test]
async fn test_readiness_failure_tears_everything_down() {
    let runtime = FakeRuntime::new();
    runtime.on_http(|_| Ok(HttpProbeResponse::new(500, "boom")));
    let manager = manager(&runtime);

    let result = manager
        .create(
            EnvironmentRequest::new("broken")
                .with_template("redis", json!({}))
                .with_template("web", json!({})),
        )
        .await;

    match result {
        Err(EngineError::Readiness(failures)) => {
            assert_eq!(failures.containers(), vec!["web"]);
            assert_eq!(failures.failures[0].attempts, 3);
            assert_eq!(
                failures.failures[0].last_error.as_deref(),
                Some("unexpected status 500")
            );
        }
        other => panic!("unexpected result: {:?}", other.map(|e| e.id().to_string())),
    }

    assert_eq!(runtime.calls_of("http_get").len(), 3);

    let started = sorted(targets(runtime.calls_of("start_container")));
    assert_eq!(sorted(targets(runtime.calls_of("stop_container"))), started);
    assert_eq!(sorted(targets(runtime.calls_of("remove_container"))), started);
    assert_eq!(manager.port_pool().leased(), 0);
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_runtime_failure_releases_created_containers() {
    let runtime = FakeRuntime::new();
    runtime.fail_on("create_container", "*");
    let manager = manager(&runtime);

    let result = manager
        .create(EnvironmentRequest::new("nocreate").with_template("redis", json!({})))
        .await;

    assert!(matches!(result, Err(EngineError::Runtime(_))));
    assert!(runtime.calls_of("start_container").is_empty());
    assert_eq!(runtime.calls_of("remove_container").len(), 1);
    assert_eq!(manager.port_pool().leased(), 0);
}

#[tokio::test]
async fn test_construction_deadline() {
    let runtime = FakeRuntime::new();
    runtime.delay("start_container", Duration::from_secs(10));
    let manager = manager_with(
        EngineSettings {
            build_timeout_secs: 1,
            ..settings()
        },
        &runtime,
    );

    let result = manager
        .create(EnvironmentRequest::new("slow").with_template("redis", json!({})))
        .await;

    assert!(matches!(
        result,
        Err(EngineError::Deadline { timeout, .. }) if timeout == Duration::from_secs(1)
    ));
    assert_eq!(runtime.calls_of("remove_container").len(), 1);
    assert_eq!(manager.port_pool().leased(), 0);
}

#[tokio::test]
async fn test_built_images_are_tagged_interpolated_and_removed() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("build").with_template("app", json!({ "port": 8080 })))
        .await
        .unwrap();

    let contexts = runtime.built_contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].tag, format!("envforge-app-api:{}-0", env.id()));

    let config = contexts[0]
        .files
        .iter()
        .find(|f| f.path == "ws/config.yml")
        .unwrap();
    assert_eq!(config.content, b"listen: 8080".to_vec());

    let specs = runtime.created_specs();
    assert_eq!(specs[0].image, contexts[0].tag);

    manager.terminate(env.id()).await.unwrap();
    assert_eq!(
        targets(runtime.calls_of("remove_image")),
        vec![contexts[0].tag.clone()]
    );
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("twice").with_template("stack", json!({})))
        .await
        .unwrap();

    env.terminate().await.unwrap();
    env.terminate().await.unwrap();

    assert_eq!(env.state().await, EnvironmentState::Terminated);
    assert_eq!(runtime.calls_of("stop_container").len(), 3);
    assert_eq!(runtime.calls_of("remove_container").len(), 3);
    assert_eq!(manager.port_pool().leased(), 0);

    // The registry still holds it until the manager is asked
    manager.terminate(env.id()).await.unwrap();
    assert!(matches!(
        manager.get(env.id()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_terminate_during_probing() {
    let runtime = FakeRuntime::new();
    runtime.on_dial(|_, _| false);
    let manager = Arc::new(manager(&runtime));

    let creating = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .create(EnvironmentRequest::new("probing").with_template("sluggish", json!({})))
                .await
        })
    };

    let env = loop {
        if let Some(export) = manager.list().await.into_iter().next() {
            let env = manager.get(&export.id).await.unwrap();
            if env.container_readiness().await.get("db") == Some(&ContainerState::Probing) {
                break env;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    env.terminate().await.unwrap();

    let result = creating.await.unwrap();
    assert!(matches!(result, Err(EngineError::Cancelled(_))));
    assert_eq!(env.state().await, EnvironmentState::Terminated);
    assert_eq!(runtime.calls_of("remove_container").len(), 1);
    assert_eq!(manager.port_pool().leased(), 0);
}

#[tokio::test]
async fn test_stop_and_restart_containers() {
    let runtime = FakeRuntime::new();
    let up = Arc::new(AtomicBool::new(true));
    let answering = up.clone();
    runtime.on_dial(move |_, _| answering.load(Ordering::SeqCst));
    let manager = manager(&runtime);

    let env = manager
        .create(EnvironmentRequest::new("cycle").with_template("redis", json!({})))
        .await
        .unwrap();
    let names = vec!["cache".to_string()];

    up.store(false, Ordering::SeqCst);
    env.stop_containers(&names).await.unwrap();
    assert_eq!(
        env.container_readiness().await["cache"],
        ContainerState::NotStarted
    );
    assert_eq!(
        targets(runtime.calls_of("stop_container")),
        vec![format!("{}-cache", env.id())]
    );

    up.store(true, Ordering::SeqCst);
    env.restart_containers(&names).await.unwrap();
    assert_eq!(env.container_readiness().await["cache"], ContainerState::Ready);
    assert_eq!(runtime.calls_of("start_container").len(), 2);

    assert!(matches!(
        env.stop_containers(&["nope".to_string()]).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_keep_alive_expiry_terminates_environment() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let mut request = EnvironmentRequest::new("expiring").with_template("redis", json!({}));
    request.options.keep_alive_secs = Some(1);
    let env = manager.create(request).await.unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        manager.keep_alive(env.id()).await.unwrap();
    }
    assert_eq!(env.state().await, EnvironmentState::Ready);

    let mut removed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if manager.get(env.id()).await.is_err() {
            removed = true;
            break;
        }
    }

    assert!(removed, "environment outlived its keep-alive");
    assert_eq!(env.state().await, EnvironmentState::Terminated);
    assert_eq!(runtime.calls_of("remove_container").len(), 1);
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    assert!(matches!(
        manager.create(EnvironmentRequest::new("empty")).await,
        Err(EngineError::Request(_))
    ));
    assert!(matches!(
        manager
            .create(EnvironmentRequest::new("missing").with_template("nope", json!({})))
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_template_catalogue() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let templates = manager.templates().await.unwrap();
    assert_eq!(templates.keys().cloned().collect::<Vec<_>>(), vec!["redis"]);
    assert_eq!(templates["redis"].version.as_deref(), Some("7"));
}

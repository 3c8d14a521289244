use futures::{stream, Stream, StreamExt};
use reconcile_core::{ObjectMeta, Resource, ResourceExt, TypeMeta};
use reconcile_runtime::{shutdown_on_signal, watcher::Event, Config, Controller};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Reconciles Redis objects served from a YAML file
#[derive(clap::Parser)]
struct App {
    /// Controller settings in YAML
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the number of workers from the config
    #[arg(long)]
    workers: Option<usize>,
    /// Only objects in this namespace are watched
    #[arg(long, short, default_value = "default")]
    namespace: String,
    /// YAML list of Redis objects, a built-in sample is used when omitted
    #[arg(long)]
    objects: Option<PathBuf>,
    /// How often the objects are relisted
    #[arg(long, default_value = "30s")]
    resync: reconcile_core::Duration,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct Redis {
    #[serde(flatten)]
    types: TypeMeta,
    #[serde(default)]
    metadata: ObjectMeta,
    spec: RedisSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
struct RedisSpec {
    replicas: u32,
}

impl Resource for Redis {
    fn kind() -> &'static str {
        "Redis"
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("redis {0} asks for zero replicas")]
    NoReplicas(String),
}

// Data we want access to in reconcile calls
struct Data {
    namespace: String,
}

/// Controller triggers this whenever a Redis object was added, updated or deleted
async fn reconcile(redis: Arc<Redis>, ctx: Arc<Data>) -> Result<(), Error> {
    if redis.spec.replicas == 0 {
        return Err(Error::NoReplicas(redis.name_any()));
    }
    info!(namespace = %ctx.namespace, "Add/Update/Delete for redis {}", redis.name_any());
    Ok(())
}

/// Where the in-memory feed gets its objects from
#[derive(Clone)]
struct Source {
    path: Option<PathBuf>,
    namespace: String,
}

impl Source {
    fn list(&self) -> anyhow::Result<Vec<Redis>> {
        let objects: Vec<Redis> = match &self.path {
            Some(path) => serde_yaml::from_str(&std::fs::read_to_string(path)?)?,
            None => vec![Redis {
                types: TypeMeta {
                    api_version: "cache.example.com/v1".into(),
                    kind: Redis::kind().into(),
                },
                metadata: ObjectMeta::namespaced(&self.namespace, "example"),
                spec: RedisSpec { replicas: 1 },
            }],
        };
        Ok(objects
            .into_iter()
            .map(|mut redis| {
                redis.meta_mut().namespace.get_or_insert_with(|| self.namespace.clone());
                redis
            })
            .filter(|redis| redis.types.kind == Redis::kind())
            .filter(|redis| redis.namespace().as_deref() == Some(self.namespace.as_str()))
            .collect())
    }
}

/// Relists `source` right away and then every `every`
fn feed(source: Source, every: Duration) -> impl Stream<Item = anyhow::Result<Event<Redis>>> {
    stream::unfold(true, move |first| {
        let source = source.clone();
        async move {
            if !first {
                tokio::time::sleep(every).await;
            }
            let events: Vec<anyhow::Result<Event<Redis>>> = match source.list() {
                Ok(objects) => std::iter::once(Event::Init)
                    .chain(objects.into_iter().map(Event::InitApply))
                    .chain(std::iter::once(Event::InitDone))
                    .map(Ok)
                    .collect(),
                Err(err) => vec![Err(err)],
            };
            Some((stream::iter(events), false))
        }
    })
    .flatten()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let app: App = clap::Parser::parse();

    let mut config = match &app.config {
        Some(path) => Config::read_from(path)?,
        None => Config::default(),
    };
    if let Some(workers) = app.workers {
        config = config.workers(workers);
    }
    config.validate()?;

    let source = Source {
        path: app.objects,
        namespace: app.namespace.clone(),
    };
    let stop = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(stop.clone()));

    Controller::new(feed(source, app.resync.into()), config)
        .run(
            reconcile,
            Arc::new(Data {
                namespace: app.namespace,
            }),
            stop,
        )
        .await;
    info!("controller shut down");
    Ok(())
}

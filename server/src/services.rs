// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Process wiring: build every backend service from the settings and pass
//! them around explicitly. No process-global state beyond the lease.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use emberbackend::{
    account::{AccountStore, InMemoryAccountStore},
    dispatch::DispatchManager,
    group::{persistence::GroupStorage, service::GroupMsgService},
    offline::{
        lease::MasterLeaseAgent,
        registry::{OfflineDispatcher, OfflineServerRegistry},
        scanner::OfflineScanner,
    },
    push::PushService,
    redis::{RedisRouter, pubsub::Publisher},
    settings::Settings,
};
use embercommon::{identifiers::Uid, pow::Challenge};
use embermetrics::{MetricsClient, MetricsConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Issued PoW challenges, by uid. One pending challenge per uid; expiry is
/// checked on redemption.
#[derive(Clone, Default)]
pub struct ChallengeStore {
    challenges: Arc<Mutex<HashMap<String, Challenge>>>,
}

impl ChallengeStore {
    pub fn issue(&self, uid: &Uid, difficulty: u32) -> Challenge {
        let challenge = Challenge::issue(difficulty);
        self.challenges
            .lock()
            .expect("challenge store lock poisoned")
            .insert(uid.to_string(), challenge.clone());
        challenge
    }

    pub fn take(&self, uid: &Uid) -> Option<Challenge> {
        self.challenges
            .lock()
            .expect("challenge store lock poisoned")
            .remove(uid.as_str())
    }
}

/// Everything the endpoints need, built once at startup.
pub struct AppServices {
    pub settings: Settings,
    pub metrics: Arc<MetricsClient>,
    pub router: Arc<RedisRouter>,
    pub dispatch: Arc<DispatchManager>,
    pub accounts: Arc<dyn AccountStore>,
    pub group_service: Arc<GroupMsgService>,
    pub push: Arc<PushService>,
    pub challenges: ChallengeStore,
    pub stop: CancellationToken,
}

impl AppServices {
    /// Build and start every backend component.
    pub fn build(settings: Settings) -> anyhow::Result<Self> {
        let stop = CancellationToken::new();

        let metrics = MetricsClient::start(MetricsConfig {
            report_queue_size: 65536,
            metrics_dir: settings.metrics.dir.clone(),
            file_size_bytes: settings.metrics.file_size_bytes,
            file_count: settings.metrics.file_count,
            client_id: settings.metrics.client_id.clone(),
            write_threshold_bytes: settings.metrics.write_threshold_bytes,
            report_interval_ms: settings.metrics.report_interval_ms,
            app_version: env!("CARGO_PKG_VERSION").into(),
        });

        let router = Arc::new(RedisRouter::new(&settings.redis)?);
        router.spawn_probe(stop.child_token());

        let pubsub_client = redis::Client::open(settings.redis.pubsub.as_str())?;
        let dispatch = DispatchManager::new(pubsub_client.clone(), stop.child_token());

        let pool = PgPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(&settings.database.connection_string())?;
        let storage = GroupStorage::new(pool);

        let group_service = Arc::new(GroupMsgService::new(
            storage,
            router.clone(),
            dispatch.clone(),
            settings.group.clone(),
        ));

        let push = PushService::new(&settings, router.clone(), stop.child_token())?;

        // offline orchestration: registry + dispatcher + lease + scanner
        let node_id = settings.application.node_id();
        let push_types = configured_push_types(&settings);
        let publisher = Arc::new(Publisher::new(pubsub_client));
        let registry = OfflineServerRegistry::new(publisher, node_id.clone(), &push_types);
        registry.spawn(stop.child_token());
        let dispatcher = Arc::new(OfflineDispatcher::new(registry, push.clone()));

        let lease = MasterLeaseAgent::new(router.clone(), node_id.clone(), &settings.offline);
        let lease_handle = lease.handle();
        lease.spawn(stop.child_token(), || {
            // the scanner checks the handle before every round; nothing
            // else to tear down on loss
        });
        OfflineScanner::new(
            router.clone(),
            dispatcher,
            lease_handle,
            settings.offline.clone(),
        )
        .spawn(stop.child_token());

        let accounts: Arc<dyn AccountStore> = Arc::new(InMemoryAccountStore::new());

        info!(node_id, "backend services started");
        Ok(Self {
            settings,
            metrics,
            router,
            dispatch,
            accounts,
            group_service,
            push,
            challenges: ChallengeStore::default(),
            stop,
        })
    }
}

/// Push types this node can serve, derived from the configured providers.
fn configured_push_types(settings: &Settings) -> Vec<String> {
    let mut types = Vec::new();
    if settings.apns.is_some() {
        types.push("apns".to_owned());
    }
    if settings.umeng.is_some() {
        types.push("umeng".to_owned());
    }
    if settings.fcm.is_some() {
        types.push("fcm".to_owned());
    }
    types
}

//! Player records backed by the write-back cache
//!
//! The record is created the first time a uid logs in and is saved right
//! away; later changes only touch the cache and reach the store on the next
//! periodic flush. Shutting the provider down flushes once more.

use super::{args, timestamp_millis};
use crate::cache::WriteBackCache;
use crate::dispatch::{AllowedStates, Provider, Request, Route};
use crate::error::DispatchError;
use crate::runtime::Runtime;
use crate::scheduler::{TaskHandle, Tick};
use crate::store::{Entity, EntityKey, EntityStore};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{codes, states, Identity};
use std::sync::Arc;
use std::time::Duration;

/// Gold a new player starts with
pub const STARTING_GOLD: i64 = 1000;
/// Gold granted per add-gold request
pub const GOLD_GRANT: i64 = 100;
/// Scene a new player starts in
pub const STARTING_SCENE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub uid: Option<Identity>,
    pub nickname: String,
    pub gold: i64,
    pub scene: i32,
    /// Unix millis
    pub create_time: u64,
    pub update_time: u64,
}

impl PlayerInfo {
    /// A fresh record for a uid that has never logged in
    pub fn new(uid: Identity) -> Self {
        let now = timestamp_millis();
        Self {
            uid: Some(uid),
            nickname: format!("player{}", uid),
            gold: STARTING_GOLD,
            scene: STARTING_SCENE,
            create_time: now,
            update_time: now,
        }
    }
}

impl Entity for PlayerInfo {
    fn key(&self) -> Option<EntityKey> {
        self.uid
    }

    fn set_key(&mut self, key: EntityKey) {
        self.uid = Some(key);
    }
}

/// Store the player cache writes back to
pub type PlayerStore = Box<dyn EntityStore<PlayerInfo>>;

pub struct PlayerProvider {
    cache: Arc<WriteBackCache<PlayerInfo, PlayerStore>>,
    flush_interval: Duration,
    flush_task: Mutex<Option<TaskHandle>>,
}

impl PlayerProvider {
    pub fn new(store: PlayerStore, flush_interval: Duration) -> Self {
        Self {
            cache: Arc::new(WriteBackCache::new(store)),
            flush_interval,
            flush_task: Mutex::new(None),
        }
    }

    pub fn cache(&self) -> &WriteBackCache<PlayerInfo, PlayerStore> {
        &self.cache
    }

    /// Loads or creates the player for a uid that just logged in
    fn check(&self, rt: &Runtime, req: Request) {
        let Some(uid) = req.arg_i64("uid") else {
            warn!("player check for {} without uid", req.connection);
            return;
        };

        let loaded = match self.cache.get(uid) {
            Ok(Some(player)) => Ok((player, false)),
            Ok(None) => self.cache.create(PlayerInfo::new(uid)).map(|p| (p, true)),
            Err(e) => Err(e),
        };

        match loaded {
            Ok((player, created)) => {
                if created {
                    info!("created player {}", uid);
                }
                rt.push(
                    req.connection,
                    codes::CHANGE_SCENE,
                    args(json!({ "scene": player.scene, "create": created })),
                );
            }
            Err(e) => error!("failed to load player {}: {}", uid, e),
        }
    }

    fn add_gold(&self, rt: &Runtime, req: Request) {
        let Some(uid) = rt.lookup_identity(req.connection) else {
            return;
        };

        let updated = self.cache.update(uid, |player| {
            player.gold += GOLD_GRANT;
            player.update_time = timestamp_millis();
        });

        match updated {
            Ok(Some(player)) => {
                rt.push(req.connection, codes::PLAYER_GOLD, args(json!({ "gold": player.gold })))
            }
            Ok(None) => debug!("no player record for uid {}", uid),
            Err(e) => error!("failed to update player {}: {}", uid, e),
        }
    }

    fn info(&self, rt: &Runtime, req: Request) {
        let Some(uid) = rt.lookup_identity(req.connection) else {
            return;
        };

        match self.cache.get(uid) {
            Ok(Some(player)) => rt.push(
                req.connection,
                codes::PLAYER_INFO_RESULT,
                args(json!({ "player": player })),
            ),
            Ok(None) => debug!("no player record for uid {}", uid),
            Err(e) => error!("failed to load player {}: {}", uid, e),
        }
    }
}

impl Provider for PlayerProvider {
    fn name(&self) -> &'static str {
        "player"
    }

    fn routes(self: Arc<Self>) -> Vec<Route> {
        let playing = || AllowedStates::only([states::AUTHORIZED, states::GAMING]);
        let check = Arc::clone(&self);
        let add_gold = Arc::clone(&self);
        let info = self;

        vec![
            Route::new(
                codes::PLAYER_CHECK,
                AllowedStates::only([states::PROGRAM]),
                move |rt, req| check.check(rt, req),
            ),
            Route::new(codes::PLAYER_ADD_GOLD, playing(), move |rt, req| {
                add_gold.add_gold(rt, req)
            }),
            Route::new(codes::PLAYER_INFO, playing(), move |rt, req| info.info(rt, req)),
        ]
    }

    fn init(&self, runtime: &Runtime) -> Result<(), DispatchError> {
        let cache = Arc::clone(&self.cache);
        let handle = runtime.schedule_repeating(self.flush_interval, move |_| {
            cache.flush();
            Tick::Continue
        });
        *self.flush_task.lock() = Some(handle);
        Ok(())
    }

    fn destroy(&self, _runtime: &Runtime) {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.cancel();
        }
        let report = self.cache.flush();
        info!(
            "final player flush: {} saved, {} failed",
            report.saved, report.failed
        );
    }
}

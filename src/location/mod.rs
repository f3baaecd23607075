//! Responder location feeds
//!
//! A user's device streams position samples; at most one sample per
//! throttle window is written to the user's profile, however often the
//! device reconnects. Profiles' location
//! fields are written only by the owner's own feed or by a principal
//! holding `users.manage`.

pub mod feed;
pub mod source;
pub mod throttle;

pub use feed::{FeedStats, LocationFeed};
pub use source::{ChannelSource, GeoError, GeoResult, GeolocationSource, PositionSample};
pub use throttle::{LocationThrottle, DEFAULT_LOCATION_WINDOW};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::auth::{tokens, PermissionCatalog, Principal};
use crate::store::{DocPath, DocumentStore, USERS};
use crate::types::{BeaconError, Result};
use feed::FeedRegistry;

/// Starts, tracks and authorizes location feeds
#[derive(Clone)]
pub struct LocationService {
    store: Arc<dyn DocumentStore>,
    catalog: Arc<PermissionCatalog>,
    throttle: Arc<LocationThrottle>,
    feeds: FeedRegistry,
}

impl LocationService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        catalog: Arc<PermissionCatalog>,
        window: Duration,
    ) -> Self {
        Self {
            store,
            catalog,
            throttle: Arc::new(LocationThrottle::new(window)),
            feeds: Arc::new(DashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.throttle.window()
    }

    /// Owners need `location.publish`; anyone else needs `users.manage`
    pub fn authorize(&self, principal: &Principal, user_id: &str) -> Result<()> {
        if principal.id == user_id {
            self.catalog.require(&principal.role, tokens::LOCATION_PUBLISH)
        } else {
            self.catalog.require(&principal.role, tokens::USERS_MANAGE)
        }
    }

    /// Open the feed for `user_id`. A feed already running for that user is
    /// cancelled first, so one user never has two writers. The new feed
    /// continues the user's current throttle window.
    pub fn open_feed<S: GeolocationSource>(
        &self,
        principal: &Principal,
        user_id: &str,
        source: S,
    ) -> Result<LocationFeed> {
        self.authorize(principal, user_id)?;
        self.throttle.cleanup(Instant::now());
        let feed = LocationFeed::start(
            Arc::clone(&self.store),
            user_id,
            source,
            Arc::clone(&self.throttle),
        );
        Ok(feed.register(&self.feeds))
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.feeds.contains_key(user_id)
    }

    pub fn active_feeds(&self) -> usize {
        self.feeds.len()
    }

    /// Administrative location write, bypassing the throttle
    pub async fn set_location(
        &self,
        principal: &Principal,
        user_id: &str,
        sample: PositionSample,
    ) -> Result<()> {
        self.catalog.require(&principal.role, tokens::USERS_MANAGE)?;
        sample
            .validate()
            .map_err(|e| BeaconError::BadRequest(e.to_string()))?;

        let commit = self
            .store
            .write(&DocPath::new(USERS, user_id), sample.to_patch())
            .await?;
        info!(user_id, by = %principal.id, seq = commit.seq, "Location set administratively");
        Ok(())
    }
}

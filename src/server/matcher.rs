//! Matchmaking: compatibility, scoring and atomic pair creation
//!
//! A search record moves `searching -> matched | cancelled | expired`;
//! terminal states are sinks. Pairing writes the chat record first and
//! then transitions both search records with compare-and-set; a lost
//! race on either transition rolls the whole pair back, so partial
//! matches are never observable.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::directory::UserDirectory;
use crate::error::{Result, TandemError};
use crate::protocol::messages::{
    DEFAULT_DISTANCE_KM, DesiredGender, Gender, Location, MatchedUser, RATING_ANY, SearchCriteria,
    SearchExpired, SearchMatched, SearchState, UserId,
};
use crate::server::breaker::CircuitBreaker;
use crate::server::hub::ConnectionHub;
use crate::server::stats::{StatsAction, StatsBroadcaster};
use crate::store::Store;
use crate::store::records::{ChatRecord, MatchedWith, SEARCH_TTL_MS, SearchRecord};

/// Earth radius used by the haversine distance
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Result of `start_search` / `cancel_search`
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub status: SearchState,
    pub matched: Option<MatchedUser>,
}

/// Result of one pairing attempt
#[derive(Debug)]
enum PairOutcome {
    /// Both records transitioned; the chat is live
    Paired,
    /// The candidate was taken by a concurrent match; try the next one
    CandidateLost,
    /// Our own record left `searching` mid-pair; stop trying
    SelfLost,
}

/// The matchmaker
pub struct Matcher {
    store: Arc<Store>,
    directory: Arc<dyn UserDirectory>,
    hub: Arc<ConnectionHub>,
    stats: Arc<StatsBroadcaster>,
    breaker: Arc<CircuitBreaker>,
}

impl Matcher {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<dyn UserDirectory>,
        hub: Arc<ConnectionHub>,
        stats: Arc<StatsBroadcaster>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            store,
            directory,
            hub,
            stats,
            breaker,
        }
    }

    /// Start (or restart) a search for `user_id`
    ///
    /// Any previous searching record is cancelled first. When a
    /// mutually compatible candidate exists, the best-scoring one is
    /// paired atomically and both sides are notified.
    pub async fn start_search(
        &self,
        user_id: UserId,
        criteria: SearchCriteria,
    ) -> Result<SearchOutcome> {
        criteria.validate()?;

        let user = self
            .directory
            .user(user_id)
            .await?
            .ok_or_else(|| TandemError::not_found("user"))?;
        if !user.is_active {
            return Err(TandemError::precondition("user is not active"));
        }

        let record = SearchRecord::new(&user, &criteria, current_timestamp());

        // Replace any previous search, then insert the new record
        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let record = record.clone();
                async move {
                    if let Some(previous) = store.active_search(record.user_id).await? {
                        store
                            .transition_search(
                                &previous.id,
                                SearchState::Searching,
                                SearchState::Cancelled,
                                None,
                            )
                            .await?;
                    }
                    store.insert_search(record).await
                }
            })
            .await?;

        self.stats.record(StatsAction::Start, record.gender).await;

        let candidates = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                async move { store.searching_snapshot().await }
            })
            .await?;

        for candidate in rank_candidates(&record, candidates) {
            match self.try_pair(&record, &candidate).await? {
                PairOutcome::Paired => {
                    self.stats.record(StatsAction::Match, record.gender).await;
                    return self.outcome_for(user_id).await;
                }
                PairOutcome::CandidateLost => {
                    debug!(
                        candidate = candidate.user_id,
                        "candidate taken mid-pair, trying next"
                    );
                    continue;
                }
                PairOutcome::SelfLost => {
                    debug!(user = user_id, "own search left searching mid-pair");
                    return self.outcome_for(user_id).await;
                }
            }
        }

        Ok(SearchOutcome {
            status: SearchState::Searching,
            matched: None,
        })
    }

    /// Cancel the user's active search
    ///
    /// Idempotent: without an active record this is a no-op, and a
    /// record that already got matched is reported as such instead of
    /// being mutated.
    pub async fn cancel_search(&self, user_id: UserId) -> Result<SearchOutcome> {
        let active = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                async move { store.active_search(user_id).await }
            })
            .await?;

        if let Some(record) = active {
            let cancelled = self
                .breaker
                .call(|| {
                    let store = Arc::clone(&self.store);
                    let id = record.id.clone();
                    async move {
                        store
                            .transition_search(
                                &id,
                                SearchState::Searching,
                                SearchState::Cancelled,
                                None,
                            )
                            .await
                    }
                })
                .await?;

            if cancelled {
                info!(user = user_id, "search cancelled");
                self.stats.record(StatsAction::Cancel, record.gender).await;
                return Ok(SearchOutcome {
                    status: SearchState::Cancelled,
                    matched: None,
                });
            }
        }

        // Lost the race, or nothing to cancel: report the latest state
        self.stats.schedule_broadcast().await;
        let latest = self.store.latest_search(user_id).await?;
        match latest {
            Some(record) if record.status == SearchState::Matched => {
                let matched = self.matched_user_for(&record).await?;
                Ok(SearchOutcome {
                    status: SearchState::Matched,
                    matched,
                })
            }
            _ => Ok(SearchOutcome {
                status: SearchState::Cancelled,
                matched: None,
            }),
        }
    }

    /// Expire searching records older than the TTL; returns the count
    pub async fn expire_stale(&self) -> Result<usize> {
        let cutoff = current_timestamp().saturating_sub(SEARCH_TTL_MS);
        let expired = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                async move { store.expire_searches(cutoff).await }
            })
            .await?;

        for record in &expired {
            info!(user = record.user_id, search = %record.id, "search expired");
            self.hub.send_to_user(record.user_id, &SearchExpired {}).await;
            self.stats.record(StatsAction::Cancel, record.gender).await;
        }
        Ok(expired.len())
    }

    /// Attempt to pair `own` with `candidate`: chat record first, then
    /// both search transitions, rolling back on any lost race
    async fn try_pair(&self, own: &SearchRecord, candidate: &SearchRecord) -> Result<PairOutcome> {
        let chat = ChatRecord::anonymous(own.user_id, candidate.user_id, current_timestamp());
        let chat_id = chat.id.clone();

        self.breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let chat = chat.clone();
                async move { store.insert_chat(chat).await }
            })
            .await?;

        let candidate_side = MatchedWith {
            user_id: own.user_id,
            telegram_id: own.telegram_id,
            chat_id: chat_id.clone(),
        };
        let candidate_won = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let id = candidate.id.clone();
                let matched = candidate_side.clone();
                async move {
                    store
                        .transition_search(
                            &id,
                            SearchState::Searching,
                            SearchState::Matched,
                            Some(matched),
                        )
                        .await
                }
            })
            .await?;

        if !candidate_won {
            self.store.delete_chat(&chat_id).await?;
            return Ok(PairOutcome::CandidateLost);
        }

        let own_side = MatchedWith {
            user_id: candidate.user_id,
            telegram_id: candidate.telegram_id,
            chat_id: chat_id.clone(),
        };
        let own_won = self
            .breaker
            .call(|| {
                let store = Arc::clone(&self.store);
                let id = own.id.clone();
                let matched = own_side.clone();
                async move {
                    store
                        .transition_search(
                            &id,
                            SearchState::Searching,
                            SearchState::Matched,
                            Some(matched),
                        )
                        .await
                }
            })
            .await?;

        if !own_won {
            // Roll the partial match back before anyone can observe it
            warn!(
                user = own.user_id,
                candidate = candidate.user_id,
                "pair rollback: own record left searching"
            );
            self.store
                .transition_search(
                    &candidate.id,
                    SearchState::Matched,
                    SearchState::Searching,
                    None,
                )
                .await?;
            self.store.delete_chat(&chat_id).await?;
            return Ok(PairOutcome::SelfLost);
        }

        info!(
            a = own.user_id,
            b = candidate.user_id,
            chat = %chat_id,
            "match formed"
        );

        // Notify only after all three writes committed
        self.hub
            .send_to_user(
                own.user_id,
                &SearchMatched {
                    matched_user: MatchedUser {
                        telegram_id: candidate.telegram_id,
                        gender: candidate.gender,
                        age: candidate.age,
                        chat_id: chat_id.clone(),
                    },
                },
            )
            .await;
        self.hub
            .send_to_user(
                candidate.user_id,
                &SearchMatched {
                    matched_user: MatchedUser {
                        telegram_id: own.telegram_id,
                        gender: own.gender,
                        age: own.age,
                        chat_id,
                    },
                },
            )
            .await;

        Ok(PairOutcome::Paired)
    }

    /// Current outcome for a user, read back from their latest record
    async fn outcome_for(&self, user_id: UserId) -> Result<SearchOutcome> {
        let latest = self
            .store
            .latest_search(user_id)
            .await?
            .ok_or_else(|| TandemError::not_found("search"))?;

        let matched = if latest.status == SearchState::Matched {
            self.matched_user_for(&latest).await?
        } else {
            None
        };

        Ok(SearchOutcome {
            status: latest.status,
            matched,
        })
    }

    /// Resolve a record's matched_with into the partner payload
    async fn matched_user_for(&self, record: &SearchRecord) -> Result<Option<MatchedUser>> {
        let matched_with = match &record.matched_with {
            Some(m) => m,
            None => return Ok(None),
        };

        let partner = self.directory.user(matched_with.user_id).await?;
        let (gender, age) = match partner {
            Some(user) => (user.gender, user.age),
            None => (Gender::Other, 0),
        };

        Ok(Some(MatchedUser {
            telegram_id: matched_with.telegram_id,
            gender,
            age,
            chat_id: matched_with.chat_id.clone(),
        }))
    }
}

/// Gender wanted by a record, with `any` treated as universal
fn desires(record: &SearchRecord, gender: Gender) -> bool {
    if record.desired_gender.contains(&DesiredGender::Any) {
        return matches!(gender, Gender::Male | Gender::Female);
    }
    match gender {
        Gender::Male => record.desired_gender.contains(&DesiredGender::Male),
        Gender::Female => record.desired_gender.contains(&DesiredGender::Female),
        Gender::Other => false,
    }
}

/// The candidate predicate: every clause must hold for `p` to be
/// eligible against the current search `s`
pub fn is_mutual_match(s: &SearchRecord, p: &SearchRecord) -> bool {
    if p.status != SearchState::Searching || p.user_id == s.user_id {
        return false;
    }
    if !desires(s, p.gender) || !desires(p, s.gender) {
        return false;
    }
    if !(s.desired_age_min..=s.desired_age_max).contains(&p.age) {
        return false;
    }
    if !(p.desired_age_min..=p.desired_age_max).contains(&s.age) {
        return false;
    }
    if s.min_acceptable_rating > RATING_ANY && p.rating < s.min_acceptable_rating {
        return false;
    }
    if s.use_geolocation {
        let within = match (p.use_geolocation, &s.location, &p.location) {
            (true, Some(a), Some(b)) => {
                let limit = s.max_distance_km.unwrap_or(DEFAULT_DISTANCE_KM);
                haversine_km(a, b) <= limit
            }
            _ => false,
        };
        if !within {
            return false;
        }
    }
    true
}

/// Compatibility score in [0, 100]: rating proximity (40), age
/// proximity (30) and geographic proximity (30)
pub fn compatibility_score(s: &SearchRecord, p: &SearchRecord) -> f64 {
    let rating = (40.0 - 2.0 * (s.rating as f64 - p.rating as f64).abs()).max(0.0);
    let age = (30.0 - 2.0 * (s.age as f64 - p.age as f64).abs()).max(0.0);
    let geo = match (s.use_geolocation, p.use_geolocation, &s.location, &p.location) {
        (true, true, Some(a), Some(b)) => (30.0 - haversine_km(a, b)).max(0.0),
        _ => 0.0,
    };
    rating + age + geo
}

/// Filter and rank candidates: best score first, ties broken by oldest
/// record, then by id for determinism
fn rank_candidates(own: &SearchRecord, candidates: Vec<SearchRecord>) -> Vec<SearchRecord> {
    let mut ranked: Vec<(f64, SearchRecord)> = candidates
        .into_iter()
        .filter(|c| c.id != own.id && is_mutual_match(own, c))
        .map(|c| (compatibility_score(own, &c), c))
        .collect();

    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.1.created_at.cmp(&b.1.created_at))
            .then_with(|| a.1.id.cmp(&b.1.id))
    });

    ranked.into_iter().map(|(_, c)| c).collect()
}

/// Great-circle distance in kilometers over a spherical Earth
///
/// The intermediate term is clamped at zero before the square root so
/// floating-point overshoot near antipodal points cannot produce NaN.
pub fn haversine_km(a: &Location, b: &Location) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).max(0.0).sqrt());

    EARTH_RADIUS_M * c / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::server::breaker::BreakerConfig;
    use crate::store::records::User;
    use std::time::Duration;

    const KM_PER_DEGREE_LAT: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0 / 1000.0;

    struct Fixture {
        matcher: Matcher,
        store: Arc<Store>,
        directory: Arc<MemoryDirectory>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::new());
        let directory = Arc::new(MemoryDirectory::new());
        let hub = Arc::new(ConnectionHub::new(
            Duration::from_secs(120),
            Duration::from_secs(120),
        ));
        let stats = Arc::new(StatsBroadcaster::new(
            Arc::clone(&store),
            directory.clone() as Arc<dyn UserDirectory>,
            Arc::clone(&hub),
            Duration::from_secs(5),
            Duration::from_secs(2),
        ));
        let breaker = Arc::new(CircuitBreaker::new("matcher", BreakerConfig::matcher()));

        Fixture {
            matcher: Matcher::new(
                Arc::clone(&store),
                directory.clone() as Arc<dyn UserDirectory>,
                hub,
                stats,
                breaker,
            ),
            store,
            directory,
        }
    }

    fn user(id: UserId, gender: Gender, age: u8) -> User {
        User {
            id,
            telegram_id: id as i64 * 1000,
            gender,
            age,
            rating: 4.0,
            is_active: true,
            last_active: current_timestamp(),
        }
    }

    fn criteria(gender: Gender, age: u8, wants: Vec<DesiredGender>) -> SearchCriteria {
        SearchCriteria {
            gender,
            age,
            rating: None,
            desired_gender: wants,
            desired_age_min: 18,
            desired_age_max: 100,
            min_acceptable_rating: None,
            use_geolocation: false,
            location: None,
            max_distance: None,
        }
    }

    fn geo_criteria(
        gender: Gender,
        wants: Vec<DesiredGender>,
        latitude: f64,
        max_distance: Option<f64>,
    ) -> SearchCriteria {
        let mut c = criteria(gender, 25, wants);
        c.use_geolocation = true;
        c.location = Some(Location {
            longitude: 0.0,
            latitude,
        });
        c.max_distance = max_distance;
        c
    }

    async fn seed(fx: &Fixture, u: &User) {
        fx.directory.insert(u.clone()).await;
    }

    #[tokio::test]
    async fn test_basic_mutual_match() {
        let fx = fixture();
        let u1 = user(1, Gender::Male, 25);
        let u2 = user(2, Gender::Female, 24);
        seed(&fx, &u1).await;
        seed(&fx, &u2).await;

        let mut c1 = criteria(Gender::Male, 25, vec![DesiredGender::Female]);
        c1.desired_age_min = 20;
        c1.desired_age_max = 30;
        let outcome = fx.matcher.start_search(1, c1).await.unwrap();
        assert_eq!(outcome.status, SearchState::Searching);

        let mut c2 = criteria(Gender::Female, 24, vec![DesiredGender::Male]);
        c2.desired_age_min = 20;
        c2.desired_age_max = 30;
        let outcome = fx.matcher.start_search(2, c2).await.unwrap();

        assert_eq!(outcome.status, SearchState::Matched);
        let matched = outcome.matched.unwrap();
        assert_eq!(matched.telegram_id, 1000);
        assert_eq!(matched.gender, Gender::Male);

        // Exactly one chat, both records matched and cross-linked
        assert_eq!(fx.store.chat_count().await, 1);
        let r1 = fx.store.latest_search(1).await.unwrap().unwrap();
        let r2 = fx.store.latest_search(2).await.unwrap().unwrap();
        assert_eq!(r1.status, SearchState::Matched);
        assert_eq!(r2.status, SearchState::Matched);
        let m1 = r1.matched_with.unwrap();
        let m2 = r2.matched_with.unwrap();
        assert_eq!(m1.user_id, 2);
        assert_eq!(m2.user_id, 1);
        assert_eq!(m1.chat_id, m2.chat_id);

        let chat = fx.store.chat(&m1.chat_id).await.unwrap().unwrap();
        assert!(chat.is_participant(1));
        assert!(chat.is_participant(2));
    }

    #[tokio::test]
    async fn test_no_mutual_compatibility() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(3, Gender::Female, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Female]))
            .await
            .unwrap();

        // U3 wants women only; U1 wants women: one-directional
        let outcome = fx
            .matcher
            .start_search(3, criteria(Gender::Female, 25, vec![DesiredGender::Female]))
            .await
            .unwrap();

        assert_eq!(outcome.status, SearchState::Searching);
        assert_eq!(fx.store.chat_count().await, 0);
        assert!(fx.store.active_search(1).await.unwrap().is_some());
        assert!(fx.store.active_search(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_any_is_universal() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Male, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();

        // `any` alongside a specific entry still means anyone
        let outcome = fx
            .matcher
            .start_search(
                2,
                criteria(
                    Gender::Male,
                    25,
                    vec![DesiredGender::Female, DesiredGender::Any],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.status, SearchState::Matched);
    }

    #[tokio::test]
    async fn test_geofence_miss_then_hit() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Female, 25)).await;

        // 11 km apart
        let delta = 11.0 / KM_PER_DEGREE_LAT;

        fx.matcher
            .start_search(
                1,
                geo_criteria(Gender::Male, vec![DesiredGender::Any], 0.0, Some(10.0)),
            )
            .await
            .unwrap();

        let outcome = fx
            .matcher
            .start_search(
                2,
                geo_criteria(Gender::Female, vec![DesiredGender::Any], delta, Some(10.0)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, SearchState::Searching);

        // Widening to 15 km produces the match
        let outcome = fx
            .matcher
            .start_search(
                2,
                geo_criteria(Gender::Female, vec![DesiredGender::Any], delta, Some(15.0)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, SearchState::Matched);
    }

    #[tokio::test]
    async fn test_geofence_boundary_1001m() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Female, 25)).await;

        let delta = 1.001 / KM_PER_DEGREE_LAT;

        fx.matcher
            .start_search(
                1,
                geo_criteria(Gender::Male, vec![DesiredGender::Any], 0.0, Some(1.0)),
            )
            .await
            .unwrap();

        // A partner at 1,001 m is outside a 1 km fence
        let outcome = fx
            .matcher
            .start_search(
                2,
                geo_criteria(Gender::Female, vec![DesiredGender::Any], delta, Some(1.0)),
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, SearchState::Searching);
    }

    #[tokio::test]
    async fn test_non_geo_search_matches_geo_candidate() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Female, 25)).await;

        fx.matcher
            .start_search(
                1,
                geo_criteria(Gender::Male, vec![DesiredGender::Any], 0.0, Some(1.0)),
            )
            .await
            .unwrap();

        // U2 has no geo constraint, so U1's fence does not apply to U2's search
        let outcome = fx
            .matcher
            .start_search(2, criteria(Gender::Female, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();
        assert_eq!(outcome.status, SearchState::Matched);
    }

    #[tokio::test]
    async fn test_min_rating_boundaries() {
        let fx = fixture();
        let mut low = user(1, Gender::Male, 25);
        low.rating = 3.0;
        let mut high = user(2, Gender::Male, 25);
        high.rating = 5.0;
        seed(&fx, &low).await;
        seed(&fx, &high).await;
        seed(&fx, &user(3, Gender::Female, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();
        fx.matcher
            .start_search(2, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();

        // Demanding rating 5 skips the 3.0 candidate and takes the 5.0 one
        let mut picky = criteria(Gender::Female, 25, vec![DesiredGender::Male]);
        picky.min_acceptable_rating = Some(5.0);
        let outcome = fx.matcher.start_search(3, picky).await.unwrap();

        assert_eq!(outcome.status, SearchState::Matched);
        assert_eq!(outcome.matched.unwrap().telegram_id, 2000);
    }

    #[tokio::test]
    async fn test_exact_age_window() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Male, 26)).await;
        seed(&fx, &user(3, Gender::Female, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();
        fx.matcher
            .start_search(2, criteria(Gender::Male, 26, vec![DesiredGender::Any]))
            .await
            .unwrap();

        // desiredAgeMin = desiredAgeMax = 25 admits identical-age partners only
        let mut exact = criteria(Gender::Female, 25, vec![DesiredGender::Male]);
        exact.desired_age_min = 25;
        exact.desired_age_max = 25;
        let outcome = fx.matcher.start_search(3, exact).await.unwrap();

        assert_eq!(outcome.status, SearchState::Matched);
        assert_eq!(outcome.matched.unwrap().age, 25);
    }

    #[tokio::test]
    async fn test_tie_break_oldest_record() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Male, 25)).await;
        seed(&fx, &user(3, Gender::Female, 25)).await;

        // Two identical candidates; force distinct created_at stamps
        let u1 = fx.directory.user(1).await.unwrap().unwrap();
        let u2 = fx.directory.user(2).await.unwrap().unwrap();
        let c = criteria(Gender::Male, 25, vec![DesiredGender::Any]);
        let mut older = SearchRecord::new(&u2, &c, current_timestamp());
        older.created_at = 1_000;
        let mut newer = SearchRecord::new(&u1, &c, current_timestamp());
        newer.created_at = 2_000;
        fx.store.insert_search(older).await.unwrap();
        fx.store.insert_search(newer).await.unwrap();

        let outcome = fx
            .matcher
            .start_search(3, criteria(Gender::Female, 25, vec![DesiredGender::Male]))
            .await
            .unwrap();

        assert_eq!(outcome.status, SearchState::Matched);
        assert_eq!(outcome.matched.unwrap().telegram_id, 2000);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_search() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Female]))
            .await
            .unwrap();
        let first = fx.store.active_search(1).await.unwrap().unwrap();

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();

        let replaced = fx.store.search(&first.id).await.unwrap().unwrap();
        assert_eq!(replaced.status, SearchState::Cancelled);

        let active = fx.store.active_search(1).await.unwrap().unwrap();
        assert_ne!(active.id, first.id);
    }

    #[tokio::test]
    async fn test_cancel_roundtrip_and_idempotence() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Female]))
            .await
            .unwrap();

        let outcome = fx.matcher.cancel_search(1).await.unwrap();
        assert_eq!(outcome.status, SearchState::Cancelled);

        let latest = fx.store.latest_search(1).await.unwrap().unwrap();
        assert_eq!(latest.status, SearchState::Cancelled);
        assert!(fx.store.active_search(1).await.unwrap().is_none());

        // Cancelling again is a no-op
        let outcome = fx.matcher.cancel_search(1).await.unwrap();
        assert_eq!(outcome.status, SearchState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_match_reports_matched() {
        let fx = fixture();
        seed(&fx, &user(1, Gender::Male, 25)).await;
        seed(&fx, &user(2, Gender::Female, 25)).await;

        fx.matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();
        fx.matcher
            .start_search(2, criteria(Gender::Female, 25, vec![DesiredGender::Any]))
            .await
            .unwrap();

        let outcome = fx.matcher.cancel_search(1).await.unwrap();
        assert_eq!(outcome.status, SearchState::Matched);
        assert!(outcome.matched.is_some());

        // The matched record was not mutated
        let latest = fx.store.latest_search(1).await.unwrap().unwrap();
        assert_eq!(latest.status, SearchState::Matched);
    }

    #[tokio::test]
    async fn test_pair_rollback_when_candidate_lost() {
        let fx = fixture();
        let u1 = user(1, Gender::Male, 25);
        let u2 = user(2, Gender::Female, 25);
        seed(&fx, &u1).await;
        seed(&fx, &u2).await;

        let c = criteria(Gender::Male, 25, vec![DesiredGender::Any]);
        let own = SearchRecord::new(&u1, &c, current_timestamp());
        let candidate = SearchRecord::new(
            &u2,
            &criteria(Gender::Female, 25, vec![DesiredGender::Any]),
            current_timestamp(),
        );
        fx.store.insert_search(own.clone()).await.unwrap();
        fx.store.insert_search(candidate.clone()).await.unwrap();

        // The candidate gets taken before our transition lands
        fx.store
            .transition_search(
                &candidate.id,
                SearchState::Searching,
                SearchState::Matched,
                None,
            )
            .await
            .unwrap();

        let outcome = fx.matcher.try_pair(&own, &candidate).await.unwrap();
        assert!(matches!(outcome, PairOutcome::CandidateLost));

        // The provisional chat was rolled back, our record still searches
        assert_eq!(fx.store.chat_count().await, 0);
        assert!(fx.store.active_search(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pair_rollback_when_self_lost() {
        let fx = fixture();
        let u1 = user(1, Gender::Male, 25);
        let u2 = user(2, Gender::Female, 25);
        seed(&fx, &u1).await;
        seed(&fx, &u2).await;

        let own = SearchRecord::new(
            &u1,
            &criteria(Gender::Male, 25, vec![DesiredGender::Any]),
            current_timestamp(),
        );
        let candidate = SearchRecord::new(
            &u2,
            &criteria(Gender::Female, 25, vec![DesiredGender::Any]),
            current_timestamp(),
        );
        fx.store.insert_search(own.clone()).await.unwrap();
        fx.store.insert_search(candidate.clone()).await.unwrap();

        // Our own record gets cancelled mid-pair
        fx.store
            .transition_search(&own.id, SearchState::Searching, SearchState::Cancelled, None)
            .await
            .unwrap();

        let outcome = fx.matcher.try_pair(&own, &candidate).await.unwrap();
        assert!(matches!(outcome, PairOutcome::SelfLost));

        // Chat deleted and the candidate restored to searching
        assert_eq!(fx.store.chat_count().await, 0);
        let restored = fx.store.active_search(2).await.unwrap().unwrap();
        assert_eq!(restored.id, candidate.id);
        assert!(restored.matched_with.is_none());
    }

    #[tokio::test]
    async fn test_start_search_requires_active_user() {
        let fx = fixture();
        let mut inactive = user(1, Gender::Male, 25);
        inactive.is_active = false;
        seed(&fx, &inactive).await;

        let err = fx
            .matcher
            .start_search(1, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await;
        assert!(matches!(err, Err(TandemError::Precondition(_))));

        let err = fx
            .matcher
            .start_search(99, criteria(Gender::Male, 25, vec![DesiredGender::Any]))
            .await;
        assert!(matches!(err, Err(TandemError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expire_stale_notifies_and_counts() {
        let fx = fixture();
        let u1 = user(1, Gender::Male, 25);
        seed(&fx, &u1).await;

        let mut old = SearchRecord::new(
            &u1,
            &criteria(Gender::Male, 25, vec![DesiredGender::Any]),
            current_timestamp(),
        );
        old.created_at = current_timestamp() - SEARCH_TTL_MS - 1;
        fx.store.insert_search(old).await.unwrap();

        let expired = fx.matcher.expire_stale().await.unwrap();
        assert_eq!(expired, 1);

        let latest = fx.store.latest_search(1).await.unwrap().unwrap();
        assert_eq!(latest.status, SearchState::Expired);

        // Fresh searches survive the sweep
        let expired = fx.matcher.expire_stale().await.unwrap();
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.19 km on a 6371 km sphere
        let a = Location {
            longitude: 0.0,
            latitude: 0.0,
        };
        let b = Location {
            longitude: 0.0,
            latitude: 1.0,
        };
        let d = haversine_km(&a, &b);
        assert!((d - 111.195).abs() < 0.01, "got {}", d);
    }

    #[test]
    fn test_haversine_zero_and_antipodal() {
        let a = Location {
            longitude: 13.4,
            latitude: 52.5,
        };
        assert_eq!(haversine_km(&a, &a), 0.0);

        // Antipodal points: half the circumference, and never NaN
        let b = Location {
            longitude: -166.6,
            latitude: -52.5,
        };
        let d = haversine_km(&a, &b);
        assert!(!d.is_nan());
        assert!((d - EARTH_RADIUS_M * std::f64::consts::PI / 1000.0).abs() < 1.0);
    }

    #[test]
    fn test_score_components() {
        let u = user(1, Gender::Male, 25);
        let c = criteria(Gender::Male, 25, vec![DesiredGender::Any]);
        let s = SearchRecord::new(&u, &c, 0);

        let v = user(2, Gender::Female, 25);
        let p = SearchRecord::new(
            &v,
            &criteria(Gender::Female, 25, vec![DesiredGender::Any]),
            0,
        );

        // Same rating, same age, no geo: 40 + 30 + 0
        assert_eq!(compatibility_score(&s, &p), 70.0);

        let mut far = p.clone();
        far.age = 45;
        // Age term floors at zero
        assert_eq!(compatibility_score(&s, &far), 40.0);
    }
}

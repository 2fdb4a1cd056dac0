use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::model::{Realm, Subscription, TopicPattern};

/// Routing table from `(realm, topic)` to subscriber names.
///
/// Built in one go from the full subscription list and never mutated
/// afterwards; the dispatcher swaps in a new table on every change.
#[derive(Debug, Default)]
pub struct SubscriptionMapping {
    routes: HashMap<Realm, Vec<Route>>,
    subscriptions: usize,
}

#[derive(Debug)]
struct Route {
    pattern: TopicPattern,
    subscribers: BTreeSet<String>,
}

impl SubscriptionMapping {
    pub fn build<'a>(subscriptions: impl IntoIterator<Item = &'a Subscription>) -> Self {
        let mut grouped: BTreeMap<(Realm, &str), BTreeSet<String>> = BTreeMap::new();
        let mut count = 0;
        for subscription in subscriptions {
            count += 1;
            for rt in &subscription.realm_topics {
                grouped
                    .entry((rt.realm(), rt.topic()))
                    .or_default()
                    .insert(subscription.name.clone());
            }
        }

        let mut routes: HashMap<Realm, Vec<Route>> = HashMap::new();
        for ((realm, topic), subscribers) in grouped {
            match TopicPattern::new(topic) {
                Ok(pattern) => routes.entry(realm).or_default().push(Route {
                    pattern,
                    subscribers,
                }),
                Err(err) => {
                    warn!(%realm, topic, error = %err, "skipping invalid topic pattern");
                }
            }
        }
        Self {
            routes,
            subscriptions: count,
        }
    }

    /// Every subscriber with an entry whose realm equals `realm` and whose
    /// pattern fully matches `topic`.
    pub fn subscribers(&self, realm: Realm, topic: &str) -> BTreeSet<String> {
        self.routes
            .get(&realm)
            .into_iter()
            .flatten()
            .filter(|route| route.pattern.full_match(topic))
            .flat_map(|route| route.subscribers.iter().cloned())
            .collect()
    }

    /// Number of subscriptions the table was built from.
    pub fn len(&self) -> usize {
        self.subscriptions
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions == 0
    }
}

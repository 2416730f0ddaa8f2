//! Place search.
//!
//! A search is a resource like any other: the query is expanded into a
//! geocoder URL, fetched by the data phase, and parsed once the response is
//! valid. Results are post-processed to drop near-duplicates and nudge
//! close, similarly relevant places ahead of distant ones.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Deserialize;

use crate::registry::{SrsInfo, SrsKind};
use crate::resource::{Resource, ResourceKind, Validity};
use crate::scheduler::ResourceCache;

/// Default geocoder URL template.
pub const DEFAULT_SEARCH_URL: &str =
    "https://nominatim.openstreetmap.org/search?q={query}&format=json&addressdetails=1&limit=20";

/// Adjacent results closer than this, in navigation units, are merged.
const MERGE_DISTANCE: f64 = 1e4;

/// Smallest radius given to a result with a bounding box.
const MIN_RADIUS: f64 = 3333.0;

/// A single search result.
///
/// Position, distance and radius stay NaN when unknown.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchItem {
    pub display_name: String,
    pub title: String,
    pub region: String,
    /// Place class reported by the geocoder, e.g. `city`.
    pub kind: String,
    pub house_number: String,
    pub road: String,
    pub city: String,
    pub county: String,
    pub state: String,
    pub state_district: String,
    pub country: String,
    pub country_code: String,
    /// Position in the navigation SRS.
    pub position: [f64; 3],
    /// Distance from the search reference point.
    pub distance: f64,
    /// Radius of the place estimated from its bounding box.
    pub radius: f64,
    pub importance: f64,
}

impl Default for SearchItem {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            title: String::new(),
            region: String::new(),
            kind: String::new(),
            house_number: String::new(),
            road: String::new(),
            city: String::new(),
            county: String::new(),
            state: String::new(),
            state_district: String::new(),
            country: String::new(),
            country_code: String::new(),
            position: [f64::NAN; 3],
            distance: f64::NAN,
            radius: f64::NAN,
            importance: -1.0,
        }
    }
}

impl SearchItem {
    fn is_populated(&self) -> bool {
        matches!(self.kind.as_str(), "hamlet" | "village" | "town" | "city")
    }
}

/// A pending or finished search.
///
/// Owned by the caller; the map only keeps a weak reference and stops
/// advancing the search once the caller drops it.
pub struct SearchTask {
    pub query: String,
    /// Reference point distances are measured from.
    pub position: [f64; 3],
    done: AtomicBool,
    results: Mutex<Vec<SearchItem>>,
    resource: Arc<Resource>,
}

impl std::fmt::Debug for SearchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchTask")
            .field("query", &self.query)
            .field("position", &self.position)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl SearchTask {
    /// Create the task and its backing resource.
    pub(crate) fn new(
        query: &str,
        position: [f64; 3],
        url_template: &str,
        cache: &ResourceCache,
    ) -> Self {
        let url = generate_search_url(url_template, query);
        let headers = vec![("Accept-Language".to_string(), "en-US,en".to_string())];
        let resource = cache.get_or_create_with_headers(&url, ResourceKind::Search, headers);
        tracing::debug!(query, url = %url, "search started");
        Self {
            query: query.to_string(),
            position,
            done: AtomicBool::new(false),
            results: Mutex::new(Vec::new()),
            resource,
        }
    }

    /// Whether the search finished. Never reverts once set.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Results so far; empty until done.
    #[must_use]
    pub fn results(&self) -> Vec<SearchItem> {
        self.results.lock().clone()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.resource.name()
    }

    fn finish(&self, results: Vec<SearchItem>) {
        *self.results.lock() = results;
        self.done.store(true, Ordering::Release);
    }
}

/// Substitute the first `{query}` token of `template` with the encoded
/// query. Templates without the token ignore the query.
#[must_use]
pub fn generate_search_url(template: &str, query: &str) -> String {
    template.replacen("{query}", &urlencoding::encode(query), 1)
}

/// Convert a geographic (lon, lat, height) point to the navigation SRS.
///
/// Geocoder results are already in the navigation SRS for the maps this
/// library supports, so this is the identity.
fn latlon_to_nav(point: [f64; 3]) -> [f64; 3] {
    point
}

/// Distance between two navigation SRS points; NaN if any coordinate is.
#[must_use]
pub fn distance(srs: &SrsInfo, a: [f64; 3], b: [f64; 3]) -> f64 {
    if a.iter().chain(b.iter()).any(|c| c.is_nan()) {
        return f64::NAN;
    }
    match srs.kind {
        SrsKind::Cartesian | SrsKind::Projected => {
            let d: f64 = a.iter().zip(b).map(|(a, b)| (b - a).powi(2)).sum();
            d.sqrt()
        }
        SrsKind::Geographic => geodesic_distance(srs.radius, a, b),
    }
}

/// Great circle distance between two (lon, lat) points in degrees.
fn geodesic_distance(radius: f64, a: [f64; 3], b: [f64; 3]) -> f64 {
    let (lon1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lon2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * radius * h.sqrt().min(1.0).asin()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Value(f64),
    Text(String),
}

impl Number {
    fn value(n: Option<&Number>) -> f64 {
        match n {
            Some(Number::Value(v)) => *v,
            Some(Number::Text(s)) => s.trim().parse().unwrap_or(f64::NAN),
            None => f64::NAN,
        }
    }
}

// Geocoders send `null` for unknown text fields as often as they omit them.
#[derive(Deserialize, Default)]
#[serde(default)]
struct Address {
    house_number: Option<String>,
    road: Option<String>,
    city: Option<String>,
    county: Option<String>,
    state: Option<String>,
    state_district: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

#[derive(Deserialize)]
struct Place {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    address: Option<Address>,
    lon: Option<Number>,
    lat: Option<Number>,
    importance: Option<Number>,
    #[serde(default)]
    boundingbox: Option<Vec<Number>>,
}

/// Parse a geocoder response.
///
/// Malformed responses yield no results.
#[must_use]
pub fn parse_search_results(data: &[u8], reference: [f64; 3], srs: &SrsInfo) -> Vec<SearchItem> {
    let places: Vec<Place> = match serde_json::from_slice(data) {
        Ok(places) => places,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse search results");
            return Vec::new();
        }
    };

    places
        .into_iter()
        .map(|place| {
            let address = place.address.unwrap_or_default();
            let position = latlon_to_nav([
                Number::value(place.lon.as_ref()),
                Number::value(place.lat.as_ref()),
                0.0,
            ]);

            let mut radius = f64::NAN;
            if let Some([south, north, west, east]) = place.boundingbox.as_deref() {
                let [s, n, w, e] = [south, north, west, east].map(|v| Number::value(Some(v)));
                radius = MIN_RADIUS;
                for corner in [[w, s, 0.0], [w, n, 0.0], [e, s, 0.0], [e, n, 0.0]] {
                    let d = distance(srs, position, latlon_to_nav(corner));
                    radius = radius.max(d);
                }
            }

            SearchItem {
                display_name: place.display_name.unwrap_or_default(),
                kind: place.kind.unwrap_or_default(),
                house_number: address.house_number.unwrap_or_default(),
                road: address.road.unwrap_or_default(),
                city: address.city.unwrap_or_default(),
                county: address.county.unwrap_or_default(),
                state: address.state.unwrap_or_default(),
                state_district: address.state_district.unwrap_or_default(),
                country: address.country.unwrap_or_default(),
                country_code: address.country_code.unwrap_or_default(),
                position,
                distance: distance(srs, reference, position),
                radius,
                importance: Number::value(place.importance.as_ref()),
                ..SearchItem::default()
            }
        })
        .collect()
}

/// Deduplicate results, derive display fields and reorder by relevance.
pub fn filter_search_results(results: &mut Vec<SearchItem>, srs: &SrsInfo) {
    if results.len() > 1 {
        results.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| b.is_populated().cmp(&a.is_populated()))
        });
        results.dedup_by(|b, a| a.display_name == b.display_name);
    }

    if results.len() > 1 {
        results.dedup_by(|b, a| distance(srs, a.position, b.position) < MERGE_DISTANCE);
    }

    for item in results.iter_mut() {
        item.title = match item.display_name.split_once(',') {
            Some((title, _)) => title.to_string(),
            None => item.display_name.clone(),
        };

        let region = [&item.county, &item.state_district, &item.state]
            .into_iter()
            .find(|r| !r.is_empty())
            .map_or("", String::as_str);
        item.region = region
            .split_once(" - ")
            .map_or(region, |(head, _)| head)
            .to_string();

        if item.title == item.house_number && !item.road.is_empty() {
            item.title = item.road.clone();
        }
    }

    stable_insertion_sort(results, |a, b| {
        a.importance < 0.4
            && b.importance < 0.4
            && (a.importance - b.importance).abs() < 0.06
            && a.distance < b.distance
    });
}

/// Stable sort that tolerates a predicate which is not a total order: an
/// element moves left only past neighbours it is strictly `less` than.
fn stable_insertion_sort<T>(items: &mut [T], less: impl Fn(&T, &T) -> bool) {
    for i in 1..items.len() {
        let mut j = i;
        while j > 0 && less(&items[j], &items[j - 1]) {
            items.swap(j, j - 1);
            j -= 1;
        }
    }
}

/// Advance pending searches, dropping finished and abandoned ones.
pub(crate) fn update_searches(
    tasks: &mut Vec<Weak<SearchTask>>,
    cache: &ResourceCache,
    srs: &SrsInfo,
    filter: bool,
) {
    tasks.retain(|weak| {
        let Some(task) = weak.upgrade() else {
            return false;
        };
        match cache.validity(&task.resource) {
            Validity::Indeterminate => true,
            Validity::Invalid => {
                tracing::debug!(query = %task.query, "search failed");
                task.finish(Vec::new());
                false
            }
            Validity::Valid => {
                let data = task.resource.raw().unwrap_or_default();
                let mut results = parse_search_results(&data, task.position, srs);
                if filter {
                    filter_search_results(&mut results, srs);
                }
                tracing::debug!(query = %task.query, results = results.len(), "search done");
                task.finish(results);
                false
            }
        }
    });
}

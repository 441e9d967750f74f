//! Ordered, search-filtered domain lists

use crate::history::models::{HistoryMatrix, HourMatrix, PopularityMetric, SortMode, ViewMode};

/// Parameters of one ordering request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortRequest {
    pub mode: SortMode,
    pub view: ViewMode,
    pub metric: PopularityMetric,
    /// Lowercased, trimmed search query; `None` when blank
    pub query: Option<String>,
}

impl SortRequest {
    pub fn new(mode: SortMode, view: ViewMode, metric: PopularityMetric, query: Option<&str>) -> Self {
        let query = query
            .map(|q| q.trim().to_lowercase())
            .filter(|q| !q.is_empty());
        Self {
            mode,
            view,
            metric,
            query,
        }
    }

    fn admits(&self, domain: &str) -> bool {
        if domain.trim().is_empty() {
            return false;
        }
        match &self.query {
            Some(query) => domain.to_lowercase().contains(query.as_str()),
            None => true,
        }
    }
}

/// Precomputed per-domain sort key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum RankKey {
    Recent(i64),
    Popular(u64),
    Alphabetical,
}

/// Filter and order domains, computing every key in one pass before sorting
///
/// The comparator only reads the precomputed keys. Ties keep input order.
fn rank<'a, I, F>(domains: I, request: &SortRequest, mut key_of: F) -> Vec<String>
where
    I: Iterator<Item = &'a str>,
    F: FnMut(&'a str) -> RankKey,
{
    let mut keyed: Vec<(&'a str, RankKey)> = domains
        .filter(|domain| request.admits(domain))
        .map(|domain| (domain, key_of(domain)))
        .collect();

    keyed.sort_by(|(a_domain, a_key), (b_domain, b_key)| match (a_key, b_key) {
        (RankKey::Alphabetical, RankKey::Alphabetical) => a_domain.cmp(b_domain),
        // Descending: most recent / most popular first
        _ => b_key.cmp(a_key),
    });

    keyed.into_iter().map(|(domain, _)| domain.to_string()).collect()
}

/// Order the domains of the day matrix
pub fn sort_domains(matrix: &HistoryMatrix, request: &SortRequest) -> Vec<String> {
    rank(matrix.keys().map(String::as_str), request, |domain| {
        let data = &matrix[domain];
        match request.mode {
            SortMode::Recent => RankKey::Recent(data.last_visit),
            SortMode::Popular => match request.metric {
                PopularityMetric::ActiveDays => RankKey::Popular(data.active_days() as u64),
                PopularityMetric::TotalVisits => RankKey::Popular(data.total_visits()),
            },
            SortMode::Alphabetical => RankKey::Alphabetical,
        }
    })
}

/// Order the domains of the hour matrix
///
/// "recent" is the newest entry across all hour buckets; "popular" sums the
/// bucket counts.
pub fn sort_domains_by_hour(hours: &HourMatrix, request: &SortRequest) -> Vec<String> {
    rank(hours.keys().map(String::as_str), request, |domain| {
        let buckets = &hours[domain];
        match request.mode {
            SortMode::Recent => RankKey::Recent(
                buckets
                    .values()
                    .filter_map(|bucket| bucket.max_last_visit())
                    .max()
                    .unwrap_or(0),
            ),
            SortMode::Popular => {
                RankKey::Popular(buckets.values().map(|bucket| bucket.count as u64).sum())
            }
            SortMode::Alphabetical => RankKey::Alphabetical,
        }
    })
}

/// Memoized ordering, recomputed only when data or request change
#[derive(Debug, Default)]
pub struct SortFilterIndex {
    cached: Option<CachedOrder>,
    recomputations: u64,
}

#[derive(Debug)]
struct CachedOrder {
    generation: u64,
    request: SortRequest,
    domains: Vec<String>,
}

impl SortFilterIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the ordering for `request` at data `generation`
    pub fn get(
        &mut self,
        generation: u64,
        request: &SortRequest,
        matrix: &HistoryMatrix,
        hours: Option<&HourMatrix>,
    ) -> &[String] {
        let fresh = matches!(
            &self.cached,
            Some(cached) if cached.generation == generation && cached.request == *request
        );

        if !fresh {
            let domains = match (request.view, hours) {
                (ViewMode::Hours, Some(hours)) => sort_domains_by_hour(hours, request),
                _ => sort_domains(matrix, request),
            };
            self.recomputations += 1;
            self.cached = Some(CachedOrder {
                generation,
                request: request.clone(),
                domains,
            });
        }

        match &self.cached {
            Some(cached) => &cached.domains,
            None => &[],
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    pub fn recomputations(&self) -> u64 {
        self.recomputations
    }
}

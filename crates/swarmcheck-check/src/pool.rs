//! Bounded concurrency over independent units of work.

use std::future::Future;

use futures::stream::{self, StreamExt};

/// Run `work` over every unit with at most `concurrency` in flight.
///
/// Each unit runs end to end on one future; only completion order varies.
/// Results come back in input order.
pub async fn for_each_bounded<T, R, F, Fut>(units: Vec<T>, concurrency: usize, mut work: F) -> Vec<R>
where
    F: FnMut(usize, T) -> Fut,
    Fut: Future<Output = R>,
{
    let mut results: Vec<(usize, R)> = stream::iter(units.into_iter().enumerate())
        .map(|(index, unit)| {
            let fut = work(index, unit);
            async move { (index, fut.await) }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

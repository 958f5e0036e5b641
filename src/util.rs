use std::future::Future;
use std::time::Duration;

use num_rational::Rational64;
use num_traits::Zero;


/// Runs a collaborator call, turning an overrun of `limit` into `on_timeout(ms)`.
pub(crate) async fn bounded<T, E, F, O>(limit: Duration, call: F, on_timeout: O) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        O: FnOnce(u128) -> E,
{
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_elapsed) => Err(on_timeout(limit.as_millis())),
    }
}


/// `part / whole`, or zero when there is no whole.
pub(crate) fn ratio(part: u64, whole: u64) -> Rational64 {
    if whole == 0 {
        Rational64::zero()
    } else {
        Rational64::new(part as i64, whole as i64)
    }
}

pub(crate) fn frac2percent(frac: Rational64) -> f64 {
    let numer_f64 = *frac.numer() as f64;
    let denom_f64 = *frac.denom() as f64;
    numer_f64 * 100.0 / denom_f64
}

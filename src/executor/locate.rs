//! Ordered locator strategies and bounded polling waits

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::oracle::{UiAction, UiOracle};
use super::Timing;
use crate::browser::{BrowserDriver, ElementHandle, Locator};

/// Try each strategy in order and return the first element found.
/// A strategy that errors is skipped; the error surfaces only when every
/// strategy errored.
pub async fn resolve(
    driver: &dyn BrowserDriver,
    strategies: &[Locator],
) -> Result<Option<ElementHandle>> {
    let mut last_err = None;
    let mut any_ok = false;

    for locator in strategies {
        match driver.locate(locator).await {
            Ok(Some(element)) => {
                debug!("Resolved {} -> {}", locator, element.label);
                return Ok(Some(element));
            }
            Ok(None) => any_ok = true,
            Err(e) => {
                debug!("Locator {} failed: {}", locator, e);
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) if !any_ok => Err(e),
        _ => Ok(None),
    }
}

/// Poll [`resolve`] until something appears or `timeout` passes
pub async fn resolve_with_wait(
    driver: &dyn BrowserDriver,
    strategies: &[Locator],
    timing: &Timing,
    timeout: std::time::Duration,
) -> Result<Option<ElementHandle>> {
    if strategies.is_empty() {
        return Ok(None);
    }

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(element) = resolve(driver, strategies).await? {
            return Ok(Some(element));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(timing.poll).await;
    }
}

/// Poll until none of the strategies match. Returns whether they vanished in time.
pub async fn wait_for_absence(
    driver: &dyn BrowserDriver,
    strategies: &[Locator],
    timing: &Timing,
    timeout: std::time::Duration,
) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if resolve(driver, strategies).await?.is_none() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(timing.poll).await;
    }
}

/// Structural strategies first; when they all fail within the step
/// timeout, ask the oracle about an accessibility snapshot.
/// A non-empty `scope` confines the oracle's pick to elements inside one
/// of those containers; `accept` can veto what remains.
pub async fn resolve_or_ask(
    driver: &dyn BrowserDriver,
    strategies: &[Locator],
    scope: &[Locator],
    timing: &Timing,
    oracle: &dyn UiOracle,
    question: &str,
    accept: impl Fn(&ElementHandle) -> bool,
) -> Result<Option<ElementHandle>> {
    if let Some(element) = resolve_with_wait(driver, strategies, timing, timing.step).await? {
        return Ok(Some(element));
    }

    let snapshot = driver.snapshot().await?;
    let answer = match oracle.ask_ui(question, &snapshot).await {
        Ok(answer) => answer,
        Err(e) => {
            warn!("UI oracle failed: {}", e);
            return Ok(None);
        }
    };

    if answer.action == UiAction::None {
        return Ok(None);
    }
    let Some(target) = answer.target.as_deref().map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };

    let element = match (snapshot.element(target), scope.is_empty()) {
        (Some(element), true) => Some(element.clone()),
        (None, true) => driver.locate(&Locator::text(target)).await?,
        (Some(element), false) => within_scope(driver, scope, &element.label).await?,
        (None, false) => within_scope(driver, scope, target).await?,
    };
    let Some(element) = element else {
        warn!("Oracle target '{}' for '{}' did not resolve in scope", target, question);
        return Ok(None);
    };

    if accept(&element) {
        debug!("Oracle resolved '{}' -> {}", question, element.label);
        Ok(Some(element))
    } else {
        warn!("Rejected oracle target '{}' for '{}'", element.label, question);
        Ok(None)
    }
}

/// Re-locate a label inside the scope containers, exact text first
async fn within_scope(driver: &dyn BrowserDriver, scope: &[Locator], label: &str) -> Result<Option<ElementHandle>> {
    let label = label.trim();
    if label.is_empty() {
        return Ok(None);
    }
    let mut strategies = Vec::with_capacity(scope.len() * 2);
    for container in scope {
        strategies.push(Locator::within(container.clone(), Locator::exact_text(label)));
    }
    for container in scope {
        strategies.push(Locator::within(container.clone(), Locator::text(label)));
    }
    resolve(driver, &strategies).await
}

pub mod delivery;
pub mod dispatcher;
pub mod mailer;
pub mod reconciliation;
pub mod registry;
pub mod report_generation;
pub mod report_lifecycle;
pub mod scheduler;

#[cfg(test)]
pub mod test_support;

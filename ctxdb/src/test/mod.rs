//! Scenario tests of the full stack (service, replication monitor, pools)
//! against the in-memory driver.


use crate::db::DatabaseService;
use crate::test_utils::{MockDriver, test_database_config};

/// Master pool 1, replica pool 2, context 42 in schema `ctx_42`
pub(crate) fn replicated_setup() -> MockDriver {
    let driver = MockDriver::new();
    driver.db.add_pool(1, 10, true);
    driver.db.add_pool(2, 10, true);
    driver.db.assign(42, 2, 1, "ctx_42");
    driver
}

pub(crate) async fn start(driver: &MockDriver) -> DatabaseService<MockDriver> {
    DatabaseService::start(driver.clone(), &test_database_config())
        .await
        .unwrap()
}

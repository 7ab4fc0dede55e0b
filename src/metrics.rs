//! Prometheus counters for provision and delete outcomes.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};

pub static PROVISION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "nfs_provisioner_provision_total",
        "Total number of provision operations by result",
        &["result"]
    )
    .expect("register provision counter")
});

pub static DELETE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "nfs_provisioner_delete_total",
        "Total number of delete operations by result",
        &["result"]
    )
    .expect("register delete counter")
});

//! End-to-end scenarios (spec.md §8) driven through the assembled
//! [`DeviceStack`], not just the individual component unit tests.

use std::sync::Arc;

use lontalk_stack::link::driver::{LinkDriver, MockLinkDriver};
use lontalk_stack::link::sicb::{cmd, Apdu, Sicb, SicbFlags};
use lontalk_stack::netmgmt::codes;
use lontalk_stack::persist::MemoryBackend;
use lontalk_stack::stack::DeviceStack;
use lontalk_stack::tables::DeviceStackTables;

fn fresh_tables() -> DeviceStackTables {
    DeviceStackTables::new(
        Arc::new(MemoryBackend::new()),
        [0x00, 0x02, 0x47, 0x94, 0x89, 0x00],
        *b"SIGNAL\x00\x01",
    )
}

#[tokio::test]
async fn s1_query_id_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);

    let reply = stack.submit_nm(Apdu::new(codes::QUERY_ID, vec![0x00]), false).await.unwrap().unwrap();
    assert_eq!(reply.code, 0x21);
    assert_eq!(
        reply.data,
        vec![0x00, 0x02, 0x47, 0x94, 0x89, 0x00, b'S', b'I', b'G', b'N', b'A', b'L', 0x00, 0x01]
    );
}

#[tokio::test]
async fn s2_update_then_query_domain_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);

    let update_data =
        vec![0x00, 0x49, 0x53, 0x49, 0x00, 0x00, 0x00, 0x03, 0x01, 0x04, 0x4B, 0xE6, 0xDA, 0x7A, 0x1F, 0x3A];
    let reply = stack.submit_nm(Apdu::new(codes::UPDATE_DOMAIN, update_data), true).await.unwrap().unwrap();
    assert_eq!(reply.code, 0x23);

    let reply = stack.submit_nm(Apdu::new(codes::QUERY_DOMAIN, vec![0x00]), true).await.unwrap().unwrap();
    assert_eq!(reply.code, 0x2A);
    assert_eq!(reply.data[7], 1);
    assert_eq!(reply.data[8], 4);
}

#[tokio::test]
async fn s3_write_config_relative_no_checksum_goes_unconfigured_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);

    // NODE_MODE/ChangeState(Configured) gets the device out of its
    // default unconfigured state before exercising the write.
    stack.submit_nm(Apdu::new(codes::NODE_MODE, vec![4, 2]), true).await.unwrap().unwrap();

    let mut data = vec![0x02, 0x00, 0x08, 0x10, 0x00];
    data.extend_from_slice(&[0u8; 16]);
    let reply = stack.submit_nm(Apdu::new(codes::WRITE_MEMORY, data), true).await.unwrap().unwrap();
    assert_eq!(reply.code, codes::success_reply(codes::WRITE_MEMORY));

    // The config-relative write with no checksum recompute dropped the
    // device back to unconfigured (spec.md §4.5), so QUERY_ID's
    // "unconfigured" selector now qualifies again.
    let reply = stack.submit_nm(Apdu::new(codes::QUERY_ID, vec![0x00]), false).await.unwrap().unwrap();
    assert_eq!(reply.code, codes::success_reply(codes::QUERY_ID));
}

#[tokio::test]
async fn s5_address_map_recycle_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);
    let domain = lontalk_stack::tables::domain::DomainId::new([1, 2, 3, 0, 0, 0], 3);

    let idx_a = stack.socket_map.set_unicast_address(1, 0, domain, 1, 5).await.unwrap();
    let idx_b = stack.socket_map.set_unicast_address(2, 0, domain, 1, 5).await.unwrap();
    assert_eq!(idx_a, idx_b);

    let addr = stack.query_ip_addr(domain, 1, 5).await;
    assert_eq!(stack.socket_map.use_count_of(addr).await, 2);

    stack.socket_map.deregister_stack(1).await;
    assert_eq!(stack.socket_map.use_count_of(addr).await, 1);
    assert!(stack.socket_map.is_bound(addr).await);

    stack.socket_map.deregister_stack(2).await;
    assert_eq!(stack.socket_map.use_count_of(addr).await, 0);
}

#[tokio::test]
async fn s6_arbitrary_ip_ages_out_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);
    let domain = lontalk_stack::tables::domain::DomainId::new([0; 6], 0);

    stack.ls_ip_map.set_arbitrary(domain, 1, 5, Some([192, 168, 1, 10]));
    assert_eq!(stack.ls_ip_map.get_arbitrary(domain, 1, 5), Some([192, 168, 1, 10]));

    for _ in 0..(lontalk_stack::lsip::AGE_LIMIT as u32 + 1) {
        stack.ls_ip_map.tick_aging();
    }
    assert_eq!(stack.ls_ip_map.get_arbitrary(domain, 1, 5), None);
    assert!(!stack.ls_ip_map.get_derived(domain, 1, 5));
}

#[tokio::test]
async fn s4_ecs_lockout_through_assembled_stack() {
    let link: Arc<dyn LinkDriver> = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let stack = DeviceStack::new(link, fresh_tables(), 4);

    let ecs_data = vec![0x00, 0x00, 0x3F, 0xFF, 0x00, 0x00];
    let reply = stack.submit_nm(Apdu::new(codes::UPDATE_NV_CONFIG_ECS, ecs_data), true).await.unwrap().unwrap();
    assert_eq!(reply.code, codes::success_reply(codes::UPDATE_NV_CONFIG_ECS));

    let legacy_data = vec![0x00, 0x00, 0x00, 0x00, 0x00];
    let reply =
        stack.submit_nm(Apdu::new(codes::UPDATE_NETWORK_VARIABLE, legacy_data), true).await.unwrap().unwrap();
    assert_eq!(reply.code, codes::failure_reply(codes::UPDATE_NETWORK_VARIABLE));
}

#[tokio::test]
async fn receive_loop_decodes_and_replies_over_the_link() {
    let driver = Arc::new(MockLinkDriver::new(4, [0; 6]));
    let link: Arc<dyn LinkDriver> = driver.clone();
    link.open("mock0").await.unwrap();
    let stack = DeviceStack::new(link, fresh_tables(), 4);

    let request = Sicb {
        command: cmd::MI_NETMGMT,
        flags: SicbFlags::default(),
        address: None,
        apdu: Apdu::new(codes::QUERY_ID, vec![0x00]),
    };
    let mut frame = vec![0x1A]; // IncomingFrameType::L2Traditional
    frame.extend_from_slice(&request.encode().unwrap());
    driver.inject_incoming(frame).await;

    let loop_stack = stack.clone();
    let handle = tokio::spawn(async move { loop_stack.run_receive_loop().await });
    tokio::time::sleep(std::time::Duration::from_millis(80)).await;
    stack.request_shutdown();
    handle.await.unwrap();
}

use super::messages::*;

#[test]
fn test_pg_request_round_trip() {
    let requests = vec![
        PgRequest::HostPgroupUpdate(vec![
            HostRelocation {
                hostid: 101,
                srcid: 0,
                dstid: 7,
            },
            HostRelocation {
                hostid: 102,
                srcid: 7,
                dstid: 0,
            },
        ]),
        PgRequest::GetProxySyncData {
            proxyid: 55,
            hostmap_revision: 12,
        },
        PgRequest::GetStats {
            name: "dc-east".to_string(),
        },
        PgRequest::ProxyLastaccess {
            proxyid: 55,
            lastaccess: 1_700_000_000,
        },
        PgRequest::Stop,
    ];

    for request in requests {
        let data = request.encode();
        let decoded = PgRequest::decode(request.code(), &data).unwrap();
        assert_eq!(request, decoded);
    }
}

#[test]
fn test_discoverer_request_codes() {
    for request in [
        DiscovererRequest::Queue,
        DiscovererRequest::UsageStats,
        DiscovererRequest::SnmpCacheReload,
        DiscovererRequest::Shutdown,
    ] {
        let decoded = DiscovererRequest::decode(request.code(), &[]).unwrap();
        assert_eq!(request, decoded);
    }
    assert!(DiscovererRequest::decode(99, &[]).is_err());
}

#[test]
fn test_queue_reply_round_trip() {
    let data = encode_queue_reply(123_456);
    assert_eq!(decode_queue_reply(&data).unwrap(), 123_456);
}

#[test]
fn test_usage_reply_round_trip() {
    let usage = vec![0.0, 0.25, 1.0];
    let data = encode_usage_reply(&usage);
    assert_eq!(decode_usage_reply(&data).unwrap(), usage);
}

#[test]
fn test_proxy_sync_reply_partial_carries_deletions() {
    let reply = ProxySyncReply {
        mode: ProxySyncMode::Partial,
        hostmap_revision: 9,
        failover_delay: "60s".to_string(),
        del_hostids: vec![4, 5, 6],
    };
    let decoded = ProxySyncReply::decode(&reply.encode()).unwrap();
    assert_eq!(reply, decoded);
}

#[test]
fn test_proxy_sync_reply_full_has_no_deletion_block() {
    let reply = ProxySyncReply {
        mode: ProxySyncMode::Full,
        hostmap_revision: 3,
        failover_delay: "1m".to_string(),
        del_hostids: vec![],
    };
    let data = reply.encode();
    // mode + revision + failover delay string, nothing else
    assert_eq!(data.len(), 1 + 8 + 4 + 2);
    let decoded = ProxySyncReply::decode(&data).unwrap();
    assert_eq!(reply, decoded);
}

#[test]
fn test_group_stats_reply_round_trip() {
    let found = GroupStatsReply::Found {
        state: 3,
        online_num: 2,
        proxyids: vec![11, 12, 13],
    };
    assert_eq!(GroupStatsReply::decode(&found.encode()).unwrap(), found);

    let missing = GroupStatsReply::NotFound;
    assert_eq!(GroupStatsReply::decode(&missing.encode()).unwrap(), missing);
}

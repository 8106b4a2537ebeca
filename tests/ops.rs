//! End-to-end tests against a scripted in-process server.

mod common;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use common::*;
use ldapmux::asn1::{parse_uint, TagClass};
use ldapmux::{
    LdapConnAsync, LdapConnSettings, LdapError, Paged, ReconnectOpts, Scope, SearchEntry,
    SearchOptions, StreamState,
};
use tokio::net::{TcpListener, TcpStream};

/// Run `script` as the server side of a single accepted connection and
/// return the URL to connect to.
async fn scripted_server<F, Fut>(script: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (sock, _) = listener.accept().await.expect("accept");
        script(sock).await;
    });
    format!("ldap://{}", addr)
}

#[tokio::test]
async fn bind_success() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 0, "expected a BindRequest");
        send_frame(&mut sock, frame.msgid, result_op(1, 0), None).await;
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    let res = ldap
        .simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind");
    assert_eq!(res.rc, 0);
    res.success().expect("bind success");
}

#[tokio::test]
async fn compare_true() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 14, "expected a CompareRequest");
        send_frame(&mut sock, frame.msgid, result_op(15, 6), None).await;
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    let matched = ldap
        .compare("cn=a,dc=example,dc=org", "sn", "Smith")
        .await
        .expect("compare")
        .equal()
        .expect("compare outcome");
    assert!(matched);
}

#[tokio::test]
async fn search_streams_all_entries() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 3, "expected a SearchRequest");
        for i in 0..3 {
            let dn = format!("cn=u{},dc=example,dc=org", i);
            send_frame(
                &mut sock,
                frame.msgid,
                entry_op(&dn, &[("cn", &[&format!("u{}", i)])]),
                None,
            )
            .await;
        }
        send_frame(&mut sock, frame.msgid, result_op(5, 0), None).await;
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    // let the server produce everything before the first poll; the stream
    // must buffer and replay in order
    let mut stream = ldap
        .streaming_search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut dns = Vec::new();
    while let Some(entry) = stream.next().await.expect("entry") {
        dns.push(SearchEntry::construct(entry).dn);
    }
    let res = stream.finish();
    assert_eq!(res.rc, 0);
    assert_eq!(
        dns,
        vec![
            "cn=u0,dc=example,dc=org",
            "cn=u1,dc=example,dc=org",
            "cn=u2,dc=example,dc=org"
        ]
    );
}

#[tokio::test]
async fn paged_search_chains_cookies() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let pages: [(&[u8], &[u8], usize); 3] =
            [(b"", b"c1", 2), (b"c1", b"c2", 2), (b"c2", b"", 1)];
        let mut serial = 0;
        for (expect_cookie, next_cookie, entries) in pages {
            let frame = read_frame(&mut sock, &mut buf).await;
            assert_eq!(frame.op.id, 3, "expected a SearchRequest");
            let cookie = request_cookie(&frame).expect("paged control in request");
            assert_eq!(cookie, expect_cookie);
            for _ in 0..entries {
                serial += 1;
                let dn = format!("cn=u{},dc=example,dc=org", serial);
                send_frame(&mut sock, frame.msgid, entry_op(&dn, &[]), None).await;
            }
            send_frame(
                &mut sock,
                frame.msgid,
                result_op(5, 0),
                Some(paged_control(0, next_cookie)),
            )
            .await;
        }
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    let mut stream = ldap
        .with_search_options(SearchOptions::new().paged(Paged::new(2)))
        .streaming_search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    let mut entries = 0;
    while stream.next().await.expect("entry").is_some() {
        entries += 1;
    }
    let res = stream.finish();
    assert_eq!(entries, 5);
    assert_eq!(stream.pages(), 3);
    assert_eq!(stream.requests(), 3);
    assert_eq!(res.rc, 0);
}

#[tokio::test]
async fn queued_add_survives_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    let settings = LdapConnSettings::new().set_reconnect(ReconnectOpts {
        initial_delay: Duration::from_millis(25),
        max_delay: Duration::from_millis(100),
        fail_after: 0,
    });
    let (conn, mut ldap) =
        LdapConnAsync::with_settings(settings, &format!("ldap://{}", addr)).expect("conn");
    ldapmux::drive!(conn);
    let server = tokio::spawn(async move {
        // let the client fail a few attempts against the closed port first
        tokio::time::sleep(Duration::from_millis(150)).await;
        let listener = TcpListener::bind(addr).await.expect("rebind");
        let (mut sock, _) = listener.accept().await.expect("accept");
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 8, "expected an AddRequest");
        send_frame(&mut sock, frame.msgid, result_op(9, 0), None).await;
        drain(sock).await;
    });
    let res = ldap
        .add(
            "cn=new,dc=example,dc=org",
            vec![("objectClass", HashSet::from(["top"]))],
        )
        .await
        .expect("add delivered after reconnect");
    assert_eq!(res.rc, 0);
    server.await.expect("server script");
}

#[tokio::test]
async fn timed_out_request_is_abandoned() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 10, "expected a DelRequest");
        // no answer; the client should give up and abandon. The outcome of
        // the verification is reported through the follow-up operation, so
        // the client side can assert on it.
        let abandon = read_frame(&mut sock, &mut buf).await;
        let mut verified = abandon.op.id == 16 && abandon.op.class == TagClass::Application;
        if verified {
            let target = abandon.op.expect_primitive().expect("abandoned id");
            verified = match parse_uint(&target) {
                Ok((_, id)) => id as i32 == frame.msgid,
                _ => false,
            };
        }
        let second = read_frame(&mut sock, &mut buf).await;
        send_frame(
            &mut sock,
            second.msgid,
            result_op(11, if verified { 0 } else { 1 }),
            None,
        )
        .await;
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    let res = ldap
        .with_timeout(Duration::from_millis(50))
        .delete("cn=slow,dc=example,dc=org")
        .await;
    assert!(matches!(res, Err(LdapError::Timeout)));
    // the server acknowledges this one only after it has seen a correct
    // AbandonRequest for the timed-out operation
    let res = ldap
        .delete("cn=probe,dc=example,dc=org")
        .await
        .expect("follow-up delete");
    assert_eq!(res.rc, 0);
}

#[tokio::test]
async fn abandoned_search_ends_quietly() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 3, "expected a SearchRequest");
        send_frame(
            &mut sock,
            frame.msgid,
            entry_op("cn=u0,dc=example,dc=org", &[]),
            None,
        )
        .await;
        let abandon = read_frame(&mut sock, &mut buf).await;
        assert_eq!(abandon.op.id, 16, "expected an AbandonRequest");
        drain(sock).await;
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    let mut stream = ldap
        .streaming_search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["cn"])
        .await
        .expect("search");
    let first = stream.next().await.expect("entry");
    assert!(first.is_some());
    stream.abandon().await.expect("abandon");
    assert!(stream.next().await.expect("end").is_none());
    assert_eq!(stream.state(), StreamState::Done);
    assert_eq!(stream.finish().rc, 88);
}

#[tokio::test]
async fn unbind_closes_the_connection() {
    let url = scripted_server(|mut sock| async move {
        let mut buf = BytesMut::new();
        let frame = read_frame(&mut sock, &mut buf).await;
        assert_eq!(frame.op.id, 0, "expected a BindRequest");
        send_frame(&mut sock, frame.msgid, result_op(1, 0), None).await;
        let unbind = read_frame(&mut sock, &mut buf).await;
        assert_eq!(unbind.op.id, 2, "expected an UnbindRequest");
        // hang up; that resolves the client's unbind
    })
    .await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).expect("conn");
    ldapmux::drive!(conn);
    ldap.simple_bind("cn=admin,dc=example,dc=org", "secret")
        .await
        .expect("bind")
        .success()
        .expect("bind success");
    ldap.unbind().await.expect("unbind");
}

#[tokio::test]
async fn destroy_fails_everything_fast() {
    // nothing is listening on the target port
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    let (conn, mut ldap) = LdapConnAsync::new(&format!("ldap://{}", addr)).expect("conn");
    ldapmux::drive!(conn);
    ldap.destroy();
    ldap.destroy();
    let res = ldap.delete("cn=gone,dc=example,dc=org").await;
    assert!(res.is_err());
    // unbind on a destroyed client resolves immediately
    ldap.unbind().await.expect("unbind");
}

//! The client transport against a server built from the framing helpers.

use adt_protocol::{Capabilities, Capability, Reply, Transport, TransportError, Verb};
use adt_protocol::{read_request, write_reply};
use tokio::io::{BufReader, duplex};

/// Echoes arguments of `copydown`, answers `capabilities`, errors otherwise.
fn spawn_echo_server() -> (Transport, tokio::task::JoinHandle<Vec<String>>) {
    let (client_w, server_r) = duplex(4096);
    let (server_w, client_r) = duplex(4096);
    let task = tokio::spawn(async move {
        let mut reader = BufReader::new(server_r);
        let mut writer = server_w;
        let mut seen = Vec::new();
        write_reply(&mut writer, &Reply::ok()).await.unwrap();
        while let Some(request) = read_request(&mut reader).await.unwrap() {
            seen.push(request.verb.clone());
            let reply = match Verb::parse(&request.verb) {
                Some(Verb::Quit) => break,
                Some(Verb::Copydown) => Reply::ok_with(request.args.iter().rev().cloned()),
                Some(Verb::Capabilities) => {
                    Reply::ok_with(["revert", "root-on-testbed", "downtmp-host=/srv/x y"])
                }
                _ => Reply::error(format!("cannot {}", request.verb)),
            };
            write_reply(&mut writer, &reply).await.unwrap();
        }
        seen
    });
    (Transport::new(client_r, client_w), task)
}

#[tokio::test(flavor = "current_thread")]
async fn arguments_survive_the_wire() {
    let (mut t, task) = spawn_echo_server();
    t.expect("ok", Some(0)).await.unwrap();

    let odd = "/tmp/dir with spaces/50%=\tdone";
    let results = t.command(Verb::Copydown, &[odd, "/plain"], Some(2)).await.unwrap();
    assert_eq!(results, ["/plain", odd]);

    let tokens = t.command(Verb::Capabilities, &[], None).await.unwrap();
    let caps = Capabilities::parse(&tokens);
    assert!(caps.has(Capability::Revert));
    assert!(caps.has(Capability::RootOnTestbed));
    assert!(!caps.has(Capability::Reboot));
    assert_eq!(caps.downtmp_host(), Some("/srv/x y"));

    t.send(Verb::Quit.as_str()).await.unwrap();
    assert_eq!(task.await.unwrap(), ["copydown", "capabilities", "quit"]);
}

#[tokio::test(flavor = "current_thread")]
async fn error_reply_is_fatal_for_the_client() {
    let (mut t, _task) = spawn_echo_server();
    t.expect("ok", Some(0)).await.unwrap();
    let err = t.command(Verb::Revert, &[], Some(1)).await.unwrap_err();
    match err {
        TransportError::UnexpectedReply { sent, got, .. } => {
            assert_eq!(sent, "revert");
            assert_eq!(got, "error cannot revert");
        }
        other => panic!("unexpected error {other}"),
    }
}

mod common;

use std::time::Duration;

use mpdhub::{client::Client, pool::Context, protocol::Command};

use common::{MockServer, Reply};

fn ctx() -> Context {
    Context::with_timeout(Duration::from_secs(1))
}

#[tokio::test]
async fn command_list_stops_at_first_failure() {
    let server = MockServer::with_script(|line| match line {
        "fail" => Reply::Ack(50, "No such song".to_owned()),
        _ => Reply::Ok(String::new()),
    })
    .await;
    let client = Client::connect(&server.config()).await.unwrap();

    let mut list = client.command_list();
    list.add(Command::new("stop"))
        .add(Command::new("fail"))
        .add(Command::new("play"));
    assert_eq!(list.len(), 3);

    let err = list.end(&ctx()).await.unwrap_err();
    let ack = err.command_error().unwrap();
    assert_eq!(ack.index, 1);
    assert_eq!(ack.command, "fail");
    assert!(list.is_empty());

    assert_eq!(server.executed(), ["stop", "fail"]);
    assert_eq!(
        server.received(),
        [
            "command_list_ok_begin",
            "stop",
            "fail",
            "play",
            "command_list_end"
        ]
    );

    // The connection survived the server's error.
    client.ping(&ctx()).await.unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn command_list_checks_every_item() {
    let server = MockServer::start().await;
    let client = Client::connect(&server.config()).await.unwrap();

    let mut list = client.command_list();
    list.add(Command::new("clear"))
        .add(Command::new("add").arg("music/album"));
    list.end(&ctx()).await.unwrap();
    assert!(list.is_empty());

    // Nothing is left unread on the connection.
    client.ping(&ctx()).await.unwrap();
    assert_eq!(server.executed(), ["clear", "add \"music/album\"", "ping"]);
}

#[tokio::test]
async fn empty_command_list_sends_nothing() {
    let server = MockServer::start().await;
    let client = Client::connect(&server.config()).await.unwrap();

    client.command_list().end(&ctx()).await.unwrap();
    assert!(server.received().is_empty());
}

#[tokio::test]
async fn decodes_songs_and_outputs() {
    let server = MockServer::with_script(|line| match line {
        "playlistinfo" => Reply::Ok(
            "file: a.flac\nArtist: A\nArtist: B\nTitle: T\nfile: b.flac\nTitle: U\n".to_owned(),
        ),
        "outputs" => Reply::Ok(
            "outputid: 0\noutputname: Speakers\nplugin: alsa\noutputenabled: 1\n\
             attribute: dop=0\noutputid: 1\noutputname: Null\nplugin: null\noutputenabled: 0\n"
                .to_owned(),
        ),
        "update" => Reply::Ok("updating_db: 3\n".to_owned()),
        _ => Reply::Ok(String::new()),
    })
    .await;
    let client = Client::connect(&server.config()).await.unwrap();

    let queue = client.playlist_info(&ctx()).await.unwrap();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].file(), Some("a.flac"));
    assert_eq!(
        queue[0].values("Artist"),
        Some(&["A".to_owned(), "B".to_owned()][..])
    );
    assert_eq!(queue[1].first("Title"), Some("U"));

    let outputs = client.outputs(&ctx()).await.unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].name, "Speakers");
    assert!(outputs[0].enabled);
    assert_eq!(outputs[0].attributes.get("dop").map(String::as_str), Some("0"));
    assert!(!outputs[1].enabled);

    assert_eq!(client.update(&ctx(), None).await.unwrap(), 3);
}

#[tokio::test]
async fn album_art_is_assembled_from_chunks() {
    let server = MockServer::with_script(|line| match line {
        "albumart \"a.flac\" 0" => Reply::Raw(b"size: 6\nbinary: 4\nabcd\nOK\n".to_vec()),
        "albumart \"a.flac\" 4" => Reply::Raw(b"size: 6\nbinary: 2\nef\nOK\n".to_vec()),
        _ => Reply::Ack(50, "No file exists".to_owned()),
    })
    .await;
    let client = Client::connect(&server.config()).await.unwrap();

    let picture = client.album_art(&ctx(), "a.flac").await.unwrap();
    assert_eq!(picture, b"abcdef");

    let picture = client.album_art(&ctx(), "none.flac").await.unwrap();
    assert!(picture.is_empty());
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn playback_commands_are_rendered() {
    let server = MockServer::start().await;
    let client = Client::connect(&server.config()).await.unwrap();

    client.play(&ctx(), Some(2)).await.unwrap();
    client.pause(&ctx(), true).await.unwrap();
    client.set_vol(&ctx(), 40).await.unwrap();
    client.seek_cur(&ctx(), 12.5).await.unwrap();
    client.output_set(&ctx(), 0, "dop", "1").await.unwrap();

    assert_eq!(
        server.executed(),
        [
            "play 2",
            "pause 1",
            "setvol 40",
            "seekcur 12.5",
            "outputset 0 \"dop\" \"1\""
        ]
    );
}

#[tokio::test]
async fn health_check_pings_until_closed() {
    let server = MockServer::start().await;
    let mut config = server.config();
    config.healthcheck_interval = Some(Duration::from_millis(20));

    let client = Client::connect(&config).await.unwrap();
    server.wait_for("ping").await;

    client.close().await.unwrap();
    server.wait_for("close").await;
}

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::NaiveDate;
use lottery_central::{
    bet::{BetBatch, BetRecord},
    central::Central,
    protocol::{read_response_line, write_request, Request, PENDING_SENTINEL, REJECTION_LINE},
    server::Server,
    settlement::WinningNumber,
    store::BetStore,
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct TestCentral {
    addr: SocketAddr,
    central: Arc<Central>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl TestCentral {
    async fn start(total_agencies: u32, max_connections: usize) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let central = Arc::new(Central::new(
            BetStore::in_memory(),
            total_agencies,
            WinningNumber(7),
        ));
        let server = Server::new(listener, Arc::clone(&central), max_connections);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            central,
            shutdown_tx,
            server,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.server.await;
    }
}

struct AgencyConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl AgencyConn {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        write_request(&mut self.writer, request).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        Ok(timeout(READ_TIMEOUT, read_response_line(&mut self.reader)).await??)
    }

    async fn submit(&mut self, bets: Vec<BetRecord>) -> Result<String> {
        self.send(&Request::Bets(BetBatch::new(bets))).await?;
        Ok(self.recv().await?.expect("bets acknowledgement"))
    }

    async fn ask_winners(addr: SocketAddr, agency: u32) -> Result<String> {
        let mut conn = Self::connect(addr).await?;
        conn.send(&Request::AskWinners { agency }).await?;
        let answer = conn.recv().await?.expect("winners answer");
        assert_eq!(conn.recv().await?, None, "query connection is one-shot");
        Ok(answer)
    }
}

fn bet(agency: u32, number: u64) -> BetRecord {
    BetRecord {
        agency,
        first_name: "Valentina".into(),
        last_name: "Ortiz".into(),
        document: format!("{:08}", 1_000 + number),
        birth_date: NaiveDate::from_ymd_opt(1987, 11, 2).expect("valid date"),
        number,
    }
}

#[tokio::test]
async fn winners_are_gated_on_every_agency_finishing() -> Result<()> {
    let central = TestCentral::start(2, 5).await?;

    let mut first = AgencyConn::connect(central.addr).await?;
    assert_eq!(first.submit(vec![bet(1, 7), bet(1, 13)]).await?, "7-13");
    first.send(&Request::DeliveryEnded { agency: 1 }).await?;

    let mut second = AgencyConn::connect(central.addr).await?;
    assert_eq!(second.submit(vec![bet(2, 7)]).await?, "7");

    first.send(&Request::AskWinners { agency: 1 }).await?;
    assert_eq!(first.recv().await?.as_deref(), Some(PENDING_SENTINEL));
    assert_eq!(first.recv().await?, None, "pending answer closes the connection");

    second.send(&Request::DeliveryEnded { agency: 2 }).await?;
    second.writer.shutdown().await?;
    assert_eq!(second.recv().await?, None);

    assert_eq!(AgencyConn::ask_winners(central.addr, 1).await?, "1");
    assert_eq!(AgencyConn::ask_winners(central.addr, 2).await?, "1");
    assert_eq!(central.central.snapshot().len(), 3);

    central.stop().await;
    Ok(())
}

#[tokio::test]
async fn malformed_line_is_dropped_from_batch() -> Result<()> {
    let central = TestCentral::start(1, 5).await?;
    let mut conn = AgencyConn::connect(central.addr).await?;

    let payload = "bets\n1|Ana|Diaz|123|1999-03-17|7\n1|Ana|Diaz\n1|Luis|Paz|456|2001-01-02|13\n";
    let mut frame = (payload.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(payload.as_bytes());
    conn.writer.write_all(&frame).await?;

    assert_eq!(conn.recv().await?.as_deref(), Some("7-13"));
    assert_eq!(central.central.snapshot().len(), 2);

    central.stop().await;
    Ok(())
}

#[tokio::test]
async fn fragmented_frame_over_tcp() -> Result<()> {
    let central = TestCentral::start(1, 5).await?;
    let mut conn = AgencyConn::connect(central.addr).await?;

    let payload = Request::Bets(BetBatch::new(vec![bet(1, 21), bet(1, 22)])).encode();
    let mut frame = (payload.len() as u16).to_be_bytes().to_vec();
    frame.extend_from_slice(payload.as_bytes());

    conn.writer.write_all(&frame[..2]).await?;
    conn.writer.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.writer.write_all(&frame[2..3]).await?;
    conn.writer.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.writer.write_all(&frame[3..]).await?;

    assert_eq!(conn.recv().await?.as_deref(), Some("21-22"));

    central.stop().await;
    Ok(())
}

#[tokio::test]
async fn connection_over_capacity_is_rejected() -> Result<()> {
    let central = TestCentral::start(2, 1).await?;

    let mut admitted = AgencyConn::connect(central.addr).await?;
    assert_eq!(admitted.submit(vec![bet(1, 5)]).await?, "5");

    let mut refused = AgencyConn::connect(central.addr).await?;
    assert_eq!(refused.recv().await?.as_deref(), Some(REJECTION_LINE));
    assert_eq!(refused.recv().await?, None);
    // The central already closed this socket, so the write may or may not error.
    let _ = refused
        .send(&Request::Bets(BetBatch::new(vec![bet(2, 99)])))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(central.central.snapshot().len(), 1);

    // Closing the admitted connection frees its slot.
    admitted.writer.shutdown().await?;
    assert_eq!(admitted.recv().await?, None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut next = AgencyConn::connect(central.addr).await?;
    assert_eq!(next.submit(vec![bet(2, 6)]).await?, "6");

    central.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_live_connections() -> Result<()> {
    let central = TestCentral::start(2, 5).await?;
    let addr = central.addr;

    let mut conn = AgencyConn::connect(addr).await?;
    assert_eq!(conn.submit(vec![bet(1, 9)]).await?, "9");

    central.stop().await;

    assert_eq!(conn.recv().await?, None);
    assert!(TcpStream::connect(addr).await.is_err());
    Ok(())
}

use std::{path::Path, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    bet::{AgencyId, BetBatch, BetRecord},
    cli::AgencyArgs,
    protocol::{read_response_line, write_request, Request, Response, BETS, MAX_FRAME_LEN},
};

/// Bytes taken by the `bets` kind line at the top of every batch frame.
const BATCH_HEADER_LEN: usize = BETS.len() + 1;

pub async fn run(args: AgencyArgs) -> Result<()> {
    select! {
        winners = submit_and_wait(&args) => {
            let winners = winners?;
            write_stdout(&format!("*** winners: {winners}")).await?;
        }
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            info!(agency = args.id, "interrupted, closing agency connection");
        }
    }
    Ok(())
}

async fn submit_and_wait(args: &AgencyArgs) -> Result<usize> {
    if args.batch_limit_bytes > MAX_FRAME_LEN {
        bail!(
            "batch limit of {} bytes exceeds the {MAX_FRAME_LEN} byte frame limit",
            args.batch_limit_bytes
        );
    }

    let mut connection = Connection::open(args).await?;
    submit_bets(args, &mut connection).await?;
    write_request(&mut connection.writer, &Request::DeliveryEnded { agency: args.id })
        .await
        .context("failed to send delivery-ended")?;
    info!(agency = args.id, "delivery ended");

    poll_winners(args, Some(connection)).await
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(args: &AgencyArgs) -> Result<Self> {
        let stream = TcpStream::connect(&args.server)
            .await
            .with_context(|| format!("failed to connect to {}", args.server))?;
        debug!(agency = args.id, server = %args.server, "connected");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn read_line(&mut self) -> Result<String> {
        read_response_line(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("server closed the connection"))
    }

    async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            debug!(?error, "failed to shutdown agency writer cleanly");
        }
    }
}

/// Streams the bets file to the server in batches bounded by count and size.
async fn submit_bets(args: &AgencyArgs, connection: &mut Connection) -> Result<()> {
    let mut rows = open_bets_file(&args.bets_file).await?;
    let mut batch = Vec::new();
    let mut batch_bytes = BATCH_HEADER_LEN;
    let mut line_no = 0usize;
    let mut sent = 0usize;

    while let Some(line) = rows.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let bet = match bet_from_csv(args.id, &line) {
            Ok(bet) => bet,
            Err(err) => {
                warn!(line = line_no, error = %err, "skipping invalid bets file row");
                continue;
            }
        };

        let bet_bytes = bet.to_wire().len() + 1;
        if !batch.is_empty()
            && (batch.len() >= args.batch_size || batch_bytes + bet_bytes > args.batch_limit_bytes)
        {
            sent += send_batch(connection, std::mem::take(&mut batch)).await?;
            batch_bytes = BATCH_HEADER_LEN;
        }
        batch_bytes += bet_bytes;
        batch.push(bet);
    }

    if !batch.is_empty() {
        sent += send_batch(connection, batch).await?;
    }
    info!(agency = args.id, bets = sent, "all bets sent");
    Ok(())
}

async fn open_bets_file(path: &Path) -> Result<Lines<BufReader<File>>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open bets file {}", path.display()))?;
    Ok(BufReader::new(file).lines())
}

/// Parses a `first_name,last_name,document,birth_date,number` row.
fn bet_from_csv(agency: AgencyId, line: &str) -> Result<BetRecord> {
    let agency = agency.to_string();
    let mut fields = vec![agency.as_str()];
    fields.extend(line.split(','));
    Ok(BetRecord::from_fields(&fields)?)
}

async fn send_batch(connection: &mut Connection, bets: Vec<BetRecord>) -> Result<usize> {
    let batch = BetBatch::new(bets);
    let expected = batch.numbers();
    write_request(&mut connection.writer, &Request::Bets(batch))
        .await
        .context("failed to send bets")?;

    let line = connection.read_line().await.context("no bets acknowledgement")?;
    match Response::decode_ack(&line)? {
        Response::Ack(numbers) if numbers == expected => {
            debug!(count = numbers.len(), "bets acknowledged");
        }
        Response::Ack(numbers) => {
            warn!(
                sent = expected.len(),
                acknowledged = numbers.len(),
                "server acknowledged a different set of bets"
            );
        }
        Response::Rejected => bail!("server rejected the connection: {line}"),
        other => bail!("unexpected acknowledgement {other:?}"),
    }
    Ok(expected.len())
}

/// Asks for the winners, reconnecting after every pending answer.
async fn poll_winners(args: &AgencyArgs, mut connection: Option<Connection>) -> Result<usize> {
    let retry = Duration::from_millis(args.retry_interval_ms);
    loop {
        let mut current = match connection.take() {
            Some(current) => current,
            None => Connection::open(args).await?,
        };

        write_request(&mut current.writer, &Request::AskWinners { agency: args.id })
            .await
            .context("failed to send ask-winners")?;
        let line = current.read_line().await.context("no winners answer")?;
        current.close().await;

        match Response::decode_winners(&line)? {
            Response::Winners(count) => {
                info!(agency = args.id, winners = count, "winners received");
                return Ok(count);
            }
            Response::Pending => {
                debug!(agency = args.id, ?retry, "draw pending, retrying");
                tokio::time::sleep(retry).await;
            }
            Response::Rejected => {
                debug!(agency = args.id, ?retry, "central at capacity, retrying");
                tokio::time::sleep(retry).await;
            }
            other => bail!("unexpected winners answer {other:?}"),
        }
    }
}

async fn write_stdout(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_row_becomes_agency_bet() {
        let bet = bet_from_csv(3, "Ana,Diaz,00123,1999-03-17,7574").expect("valid row");
        assert_eq!(bet.agency, 3);
        assert_eq!(bet.document, "00123");
        assert_eq!(bet.number, 7574);
        assert!(bet_from_csv(3, "Ana,Diaz,00123,1999-03-17").is_err());
    }
}

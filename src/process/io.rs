use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;

/// Receives each line the child (or peer) writes to stderr.
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Pumps outbound lines into a writer, one message per line, flushing after
/// each so framed messages never interleave.
pub async fn pump_outbound<W>(writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_line(&mut writer, &line).await {
            log::error!("error writing outbound message: {}", e);
            break;
        }
    }
}

/// Pumps inbound lines from a reader into a channel, skipping blank lines.
/// Ends on EOF or when the consumer goes away.
pub async fn pump_inbound<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                log::debug!("inbound stream reached EOF");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                if tx.send(trimmed.to_string()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                log::error!("error reading inbound message: {}", e);
                break;
            }
        }
    }
}

/// Forwards stderr lines to the host-provided sink (or drains them).
pub async fn pump_stderr<R>(reader: R, sink: Option<StderrSink>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(sink) = &sink {
                    sink(line.trim_end());
                }
            }
            Err(e) => {
                log::debug!("error reading stderr: {}", e);
                break;
            }
        }
    }
}

async fn write_line<W>(writer: &mut BufWriter<W>, line: &str) -> tokio::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

use std::future::Future;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::cache::{Cache, Clock, SystemClock};
use crate::dns_message::{Message, RecordSets, ResponseCode};
use crate::dns_question_and_answer::DnsQuestion;
use crate::forwarder::Upstream;

/// Large enough for EDNS clients; anything longer is cut by the kernel
pub const INBOUND_BUFFER_SIZE: usize = 4096;

/// Caching DNS forwarder bound to one UDP socket
pub struct DnsServer<U, C: Clock = SystemClock> {
    socket: UdpSocket,
    cache: Cache<C>,
    upstream: U,
}

impl<U: Upstream, C: Clock> DnsServer<U, C> {
    /// Bind the listening socket and take ownership of the cache
    pub async fn bind(bind_addr: SocketAddr, cache: Cache<C>, upstream: U) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self::new(socket, cache, upstream))
    }

    pub fn new(socket: UdpSocket, cache: Cache<C>, upstream: U) -> Self {
        DnsServer {
            socket,
            cache,
            upstream,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    /// Serve datagrams until `shutdown` completes, then hand the cache back
    /// so it can be persisted
    pub async fn run_until<F: Future>(mut self, shutdown: F) -> Cache<C> {
        let mut buf = [0u8; INBOUND_BUFFER_SIZE];
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down DNS server");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((size, source)) => {
                        debug!("Received {} bytes from {}", size, source);

                        if let Some(response) = self.handle_request(&buf[..size]).await {
                            if let Err(e) = self.socket.send_to(&response, source).await {
                                warn!("Failed to send response to {}: {}", source, e);
                            }
                        }
                    }
                    Err(e) => warn!("Error receiving data: {}", e),
                },
            }
        }

        self.cache
    }

    /// Handle one datagram: decode, answer every question, encode the reply.
    /// `None` means nothing should be sent back.
    pub async fn handle_request(&mut self, buf: &[u8]) -> Option<Bytes> {
        let query = match Message::from_bytes(buf) {
            Ok(query) => query,
            Err(e) => {
                debug!("Dropping undecodable datagram: {}", e);
                return None;
            }
        };

        let response = match self.resolve_all(&query.questions).await {
            Some(records) => Message::response_to(&query, records, ResponseCode::NoError),
            None => Message::response_to(&query, RecordSets::default(), ResponseCode::ServerFailure),
        };

        match response.to_bytes() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to encode response {:#06x}: {}", query.id, e);
                None
            }
        }
    }

    /// Records for all questions, first question first. Each upstream reply is
    /// cached as it arrives; if a later question fails, the entries added for
    /// this query are dropped again so no partial result stays behind.
    async fn resolve_all(&mut self, questions: &[DnsQuestion]) -> Option<RecordSets> {
        let mut combined = RecordSets::default();
        let mut inserted: Vec<&DnsQuestion> = Vec::new();

        for question in questions {
            let records = match self.cached(question) {
                Some(records) => records,
                None => match self.ask_upstream(question).await {
                    Some(records) => {
                        self.cache.insert(question.clone(), records.clone());
                        inserted.push(question);
                        records
                    }
                    None => {
                        // a miss means nothing fresh was there before, so removal restores it
                        for question in inserted {
                            self.cache.remove(question);
                        }
                        return None;
                    }
                },
            };
            combined.extend(records);
        }

        Some(combined)
    }

    fn cached(&mut self, question: &DnsQuestion) -> Option<RecordSets> {
        let present = self.cache.contains(question);
        let hit = self.cache.lookup(question);

        match (&hit, present) {
            (Some(_), _) => debug!("Cache hit for {}", question.describe()),
            (None, true) => debug!("Cache entry for {} expired", question.describe()),
            (None, false) => debug!("Cache miss for {}", question.describe()),
        }
        hit
    }

    async fn ask_upstream(&self, question: &DnsQuestion) -> Option<RecordSets> {
        let query = Message::query(vec![question.clone()]);
        let payload = query
            .to_bytes()
            .map_err(|e| warn!("Failed to encode upstream query for {}: {}", question.describe(), e))
            .ok()?;

        let reply = self
            .upstream
            .resolve(&payload)
            .await
            .map_err(|e| warn!("Upstream failed for {}: {}", question.describe(), e))
            .ok()?;

        let reply = Message::from_bytes(&reply)
            .map_err(|e| warn!("Undecodable upstream reply for {}: {}", question.describe(), e))
            .ok()?;

        if reply.id != query.id {
            warn!(
                "Upstream reply id {:#06x} does not match query id {:#06x}",
                reply.id, query.id
            );
            return None;
        }

        Some(reply.into_records())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::test_clock::ManualClock;
    use crate::dns_question_and_answer::{RecordType, ResourceRecord, CLASS_IN};
    use crate::error::UpstreamError;
    use crate::forwarder::UPSTREAM_TIMEOUT;

    enum Scripted {
        Answer(RecordSets),
        Silent,
        Garbage,
        /// Sent as is, apart from the id which is copied from the query
        Raw(Vec<u8>),
    }

    /// Answers by question name and remembers every name it was asked about.
    /// With a latency set, each reply moves the shared clock forward first.
    #[derive(Default)]
    struct ScriptedUpstream {
        script: HashMap<String, Scripted>,
        asked: RefCell<Vec<String>>,
        latency: Option<(ManualClock, Duration)>,
    }

    impl ScriptedUpstream {
        fn with(mut self, name: &str, scripted: Scripted) -> Self {
            self.script.insert(name.to_string(), scripted);
            self
        }

        fn with_latency(mut self, clock: ManualClock, latency: Duration) -> Self {
            self.latency = Some((clock, latency));
            self
        }

        fn asked(&self) -> Vec<String> {
            self.asked.borrow().clone()
        }
    }

    #[async_trait(?Send)]
    impl Upstream for ScriptedUpstream {
        async fn resolve(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
            let query = Message::from_bytes(query).unwrap();
            assert_eq!(query.questions.len(), 1);
            assert!(query.recursion_desired);

            let name = query.questions[0].name.clone();
            self.asked.borrow_mut().push(name.clone());
            if let Some((clock, latency)) = &self.latency {
                clock.advance(*latency);
            }

            match self.script.get(&name) {
                Some(Scripted::Answer(records)) => {
                    let reply = Message::response_to(&query, records.clone(), ResponseCode::NoError);
                    Ok(reply.to_bytes().unwrap().to_vec())
                }
                Some(Scripted::Garbage) => Ok(vec![0u8; 5]),
                Some(Scripted::Raw(bytes)) => {
                    let mut reply = bytes.clone();
                    reply[..2].copy_from_slice(&query.id.to_be_bytes());
                    Ok(reply)
                }
                Some(Scripted::Silent) | None => Err(UpstreamError::Timeout(UPSTREAM_TIMEOUT)),
            }
        }
    }

    fn question(name: &str) -> DnsQuestion {
        DnsQuestion::new(name, RecordType::A.to_u16(), CLASS_IN)
    }

    fn answer(name: &str, ttl: u32, ip: [u8; 4]) -> RecordSets {
        RecordSets {
            answer: vec![ResourceRecord::new_a_record(name, ttl, ip)],
            ..RecordSets::default()
        }
    }

    fn query_bytes(id: u16, names: &[&str]) -> Vec<u8> {
        let mut query = Message::query(names.iter().map(|name| question(name)).collect());
        query.id = id;
        query.to_bytes().unwrap().to_vec()
    }

    async fn server(
        upstream: ScriptedUpstream,
        clock: ManualClock,
    ) -> DnsServer<ScriptedUpstream, ManualClock> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        DnsServer::new(socket, Cache::with_clock(clock), upstream)
    }

    #[tokio::test]
    async fn test_short_datagram_gets_no_response() {
        let mut server = server(ScriptedUpstream::default(), ManualClock::new()).await;
        assert_eq!(server.handle_request(&[0u8; 10]).await, None);
        assert!(server.upstream().asked().is_empty());
    }

    #[tokio::test]
    async fn test_cached_then_expired() {
        let clock = ManualClock::new();
        let upstream = ScriptedUpstream::default()
            .with("example.com.", Scripted::Answer(answer("example.com.", 300, [93, 184, 216, 34])));
        let mut server = server(upstream, clock.clone()).await;
        let query = query_bytes(0x1234, &["example.com."]);

        let first = server.handle_request(&query).await.unwrap();
        let decoded = Message::from_bytes(&first).unwrap();
        assert_eq!(decoded.id, 0x1234);
        assert_eq!(decoded.response_code, ResponseCode::NoError);
        assert_eq!(decoded.records, answer("example.com.", 300, [93, 184, 216, 34]));
        assert!(server.cache.contains(&question("example.com.")));
        assert_eq!(server.upstream().asked().len(), 1);

        clock.advance(Duration::from_secs(299));
        let second = server.handle_request(&query).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(server.upstream().asked().len(), 1);

        clock.advance(Duration::from_secs(2));
        server.handle_request(&query).await.unwrap();
        assert_eq!(server.upstream().asked().len(), 2);
    }

    #[tokio::test]
    async fn test_answers_are_concatenated_in_question_order() {
        let clock = ManualClock::new();
        let upstream = ScriptedUpstream::default()
            .with("b.example.", Scripted::Answer(answer("b.example.", 60, [2, 2, 2, 2])));
        let mut server = server(upstream, clock).await;
        server
            .cache
            .insert(question("a.example."), answer("a.example.", 60, [1, 1, 1, 1]));

        let response = server
            .handle_request(&query_bytes(7, &["a.example.", "b.example."]))
            .await
            .unwrap();
        let decoded = Message::from_bytes(&response).unwrap();

        let mut expected = answer("a.example.", 60, [1, 1, 1, 1]);
        expected.extend(answer("b.example.", 60, [2, 2, 2, 2]));
        assert_eq!(decoded.records, expected);
        assert_eq!(decoded.questions.len(), 2);
        assert_eq!(server.upstream().asked(), vec!["b.example.".to_string()]);
    }

    #[tokio::test]
    async fn test_one_failed_question_fails_the_whole_query() {
        let upstream = ScriptedUpstream::default()
            .with("a.example.", Scripted::Answer(answer("a.example.", 60, [1, 1, 1, 1])))
            .with("b.example.", Scripted::Silent)
            .with("c.example.", Scripted::Answer(answer("c.example.", 60, [3, 3, 3, 3])));
        let mut server = server(upstream, ManualClock::new()).await;

        let response = server
            .handle_request(&query_bytes(9, &["a.example.", "b.example.", "c.example."]))
            .await
            .unwrap();
        let decoded = Message::from_bytes(&response).unwrap();

        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.response_code, ResponseCode::ServerFailure);
        assert_eq!(decoded.records, RecordSets::default());
        assert_eq!(decoded.questions.len(), 3);
        // remaining questions are never attempted, nothing is cached
        assert_eq!(
            server.upstream().asked(),
            vec!["a.example.".to_string(), "b.example.".to_string()]
        );
        assert!(server.cache.is_empty());
    }

    #[tokio::test]
    async fn test_entries_are_stamped_when_their_reply_arrives() {
        let clock = ManualClock::new();
        let start = clock.now();
        let upstream = ScriptedUpstream::default()
            .with("a.example.", Scripted::Answer(answer("a.example.", 12, [1, 1, 1, 1])))
            .with("b.example.", Scripted::Answer(answer("b.example.", 60, [2, 2, 2, 2])))
            .with_latency(clock.clone(), Duration::from_secs(5));
        let mut server = server(upstream, clock.clone()).await;

        server
            .handle_request(&query_bytes(5, &["a.example.", "b.example."]))
            .await
            .unwrap();

        let stamp = |name: &str| {
            server
                .cache
                .entries()
                .find(|(q, _)| q.name == name)
                .map(|(_, entry)| entry.cached_at)
        };
        assert_eq!(stamp("a.example."), Some(start + Duration::from_secs(5)));
        assert_eq!(stamp("b.example."), Some(start + Duration::from_secs(10)));

        // a.example. expires 12 s after its own reply, not after the query finished
        clock.advance(Duration::from_secs(7));
        server
            .handle_request(&query_bytes(6, &["a.example."]))
            .await
            .unwrap();
        assert_eq!(
            server.upstream().asked(),
            vec![
                "a.example.".to_string(),
                "b.example.".to_string(),
                "a.example.".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_upstream_reply_with_reserved_label_type_is_not_cached() {
        // answer name starts with a 0x40 length byte, which is not a valid label type
        let mut reply = vec![0, 0, 0x81, 0x80, 0, 0, 0, 1, 0, 0, 0, 0];
        reply.push(0x40);
        reply.extend(std::iter::repeat(b'a').take(64));
        reply.extend_from_slice(&[0, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4, 1, 2, 3, 4]);

        let upstream = ScriptedUpstream::default().with("example.com.", Scripted::Raw(reply));
        let mut server = server(upstream, ManualClock::new()).await;

        let response = server
            .handle_request(&query_bytes(2, &["example.com."]))
            .await
            .unwrap();

        assert_eq!(
            Message::from_bytes(&response).unwrap().response_code,
            ResponseCode::ServerFailure
        );
        assert_eq!(server.upstream().asked().len(), 1);
        assert!(server.cache.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_upstream_reply_is_a_server_failure() {
        let upstream = ScriptedUpstream::default().with("example.com.", Scripted::Garbage);
        let mut server = server(upstream, ManualClock::new()).await;

        let response = server
            .handle_request(&query_bytes(1, &["example.com."]))
            .await
            .unwrap();

        assert_eq!(
            Message::from_bytes(&response).unwrap().response_code,
            ResponseCode::ServerFailure
        );
        assert!(!server.cache.contains(&question("example.com.")));
    }

    #[tokio::test]
    async fn test_repeated_question_asks_upstream_once() {
        let upstream = ScriptedUpstream::default()
            .with("example.com.", Scripted::Answer(answer("example.com.", 60, [1, 2, 3, 4])));
        let mut server = server(upstream, ManualClock::new()).await;

        let response = server
            .handle_request(&query_bytes(3, &["example.com.", "example.com."]))
            .await
            .unwrap();

        assert_eq!(Message::from_bytes(&response).unwrap().records.answer.len(), 2);
        assert_eq!(server.upstream().asked().len(), 1);
    }

    #[tokio::test]
    async fn test_serves_over_udp_until_shutdown() {
        let upstream = ScriptedUpstream::default()
            .with("example.com.", Scripted::Answer(answer("example.com.", 60, [1, 2, 3, 4])));
        let server = server(upstream, ManualClock::new()).await;
        let server_addr = server.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();

        let client = async move {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            socket.send_to(&[0u8; 10], server_addr).await.unwrap();
            socket
                .send_to(&query_bytes(0x4242, &["example.com."]), server_addr)
                .await
                .unwrap();

            // the malformed datagram is dropped, so the first reply is for the query
            let mut buf = [0u8; 512];
            let (size, _) = socket.recv_from(&mut buf).await.unwrap();
            let _ = stop.send(());
            Message::from_bytes(&buf[..size]).unwrap()
        };

        let (cache, reply) = tokio::join!(
            server.run_until(async {
                let _ = stopped.await;
            }),
            client
        );

        assert_eq!(reply.id, 0x4242);
        assert_eq!(reply.records, answer("example.com.", 60, [1, 2, 3, 4]));
        assert_eq!(cache.len(), 1);
    }
}

//! Loop + TCP + HTTP engine, exercised over real sockets on 127.0.0.1.
//!
//! Every test drives one loop to completion: callbacks stop the loop when
//! the interesting events have fired, and a failsafe timer stops it late
//! so a broken run fails its assertions instead of hanging.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use relay_io::http::{Headers, HttpClient, HttpServer, ServerExchange};
use relay_io::tcp::{TcpClient, TcpConnection, TcpServer};
use relay_io::Loop;

fn test_loop() -> Loop {
    let lp = Loop::new().expect("loop");
    lp.set_precision(Duration::from_millis(5));
    lp.schedule(Duration::from_secs(10), |lp| lp.stop());
    lp
}

#[derive(Default)]
struct ClientLog {
    starts: Vec<(u16, String)>,
    body: Vec<u8>,
    done: u32,
    trailer_check: Vec<String>,
    errors: Vec<String>,
}

fn watch(
    ex: &relay_io::http::ClientExchange,
    lp: &Loop,
) -> Rc<RefCell<ClientLog>> {
    let log: Rc<RefCell<ClientLog>> = Rc::new(RefCell::new(ClientLog::default()));

    {
        let log = log.clone();
        ex.on_response_start(move |head| {
            log.borrow_mut()
                .starts
                .push((head.status, head.phrase.clone()));
        });
    }
    {
        let log = log.clone();
        ex.on_response_body(move |chunk| log.borrow_mut().body.extend_from_slice(chunk));
    }
    {
        let log = log.clone();
        let lp = lp.clone();
        ex.on_response_done(move |trailers| {
            let mut log = log.borrow_mut();
            log.done += 1;
            log.trailer_check.extend(trailers.get("x-check"));
            lp.stop();
        });
    }
    {
        let log = log.clone();
        let lp = lp.clone();
        ex.on_error(move |err| {
            log.borrow_mut().errors.push(err.kind_str().to_string());
            lp.stop();
        });
    }

    log
}

fn origin(server: &HttpServer) -> String {
    let addr = server.local_addr().expect("addr");
    format!("http://127.0.0.1:{}", addr.port())
}

// Responds to every request once its body is fully read.
fn respond_with(server: &HttpServer, f: impl Fn(&ServerExchange) + 'static) {
    let f = Rc::new(f);
    server.on_exchange(move |ex| {
        let ex2 = ex.clone();
        let f = f.clone();
        ex.on_request_done(move |_| (*f)(&ex2));
    });
}

#[test]
fn chunked_get_with_trailers_and_pool_return() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");

    respond_with(&server, |ex| {
        ex.response_start(200, "OK", &Headers::new());
        ex.response_body(b"hello");
        let trailers: Headers = [("X-Check", "ok")].into_iter().collect();
        ex.response_done(&trailers);
    });

    let client = HttpClient::new(&lp);
    let ex = client.exchange();
    let log = watch(&ex, &lp);

    ex.request_start("GET", &format!("{}/a", origin(&server)), &Headers::new());
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert_eq!(log.starts, vec![(200, "OK".to_string())]);
    assert_eq!(log.body, b"hello");
    assert_eq!(log.done, 1);
    assert_eq!(log.trailer_check, vec!["ok"]);
    assert!(log.errors.is_empty());
    assert_eq!(
        ex.state(),
        relay_io::http::ExchangeState::Done
    );
    // the connection went back to the pool
    assert_eq!(client.idle_connections(), 1);
}

#[test]
fn content_length_framing_and_reuse() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");

    let served = Rc::new(Cell::new(0u32));
    {
        let served = served.clone();
        respond_with(&server, move |ex| {
            served.set(served.get() + 1);
            let headers: Headers = [("Content-Length", "3")].into_iter().collect();
            ex.response_start(200, "OK", &headers);
            ex.response_body(b"abc");
            ex.response_done(&Headers::new());
        });
    }

    let client = HttpClient::new(&lp);
    let uri = format!("{}/b", origin(&server));

    // (body, idle connections at completion) per exchange
    let done_log: Rc<RefCell<Vec<(Vec<u8>, usize)>>> = Rc::new(RefCell::new(Vec::new()));

    let ex1 = client.exchange();
    let body1: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let body1 = body1.clone();
        ex1.on_response_body(move |chunk| body1.borrow_mut().extend_from_slice(chunk));
    }
    {
        let client2 = client.clone();
        let lp2 = lp.clone();
        let uri2 = uri.clone();
        let done_log = done_log.clone();
        ex1.on_response_done(move |_| {
            done_log
                .borrow_mut()
                .push((body1.borrow().clone(), client2.idle_connections()));

            // second exchange rides the pooled connection, inside the
            // same loop run
            let ex2 = client2.exchange();
            let body2: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
            {
                let body2 = body2.clone();
                ex2.on_response_body(move |chunk| body2.borrow_mut().extend_from_slice(chunk));
            }
            {
                let lp3 = lp2.clone();
                let client3 = client2.clone();
                let done_log = done_log.clone();
                ex2.on_response_done(move |_| {
                    done_log
                        .borrow_mut()
                        .push((body2.borrow().clone(), client3.idle_connections()));
                    lp3.stop();
                });
            }
            ex2.request_start("GET", &uri2, &Headers::new());
            ex2.request_done(&Headers::new());
        });
    }
    ex1.request_start("GET", &uri, &Headers::new());
    ex1.request_done(&Headers::new());

    lp.run().expect("run");

    assert_eq!(
        *done_log.borrow(),
        vec![(b"abc".to_vec(), 1), (b"abc".to_vec(), 1)]
    );
    assert_eq!(served.get(), 2);
}

#[test]
fn request_body_is_echoed() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");

    // echo the chunk-encoded request body back, length-framed
    server.on_exchange(move |ex| {
        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        {
            let received = received.clone();
            ex.on_request_body(move |chunk| received.borrow_mut().extend_from_slice(chunk));
        }
        let ex2 = ex.clone();
        ex.on_request_done(move |_| {
            let body = received.borrow();
            let headers: Headers = [("Content-Length", body.len().to_string().as_str())]
                .into_iter()
                .collect();
            ex2.response_start(200, "OK", &headers);
            ex2.response_body(&body);
            ex2.response_done(&Headers::new());
        });
    });

    let client = HttpClient::new(&lp);
    let ex = client.exchange();
    let log = watch(&ex, &lp);

    ex.request_start("POST", &format!("{}/echo", origin(&server)), &Headers::new());
    ex.request_body(b"hello ");
    ex.request_body(b"world");
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert!(log.errors.is_empty());
    assert_eq!(log.body, b"hello world");
}

#[test]
fn idempotent_request_is_retried_after_early_close() {
    let lp = test_loop();

    // raw server: kills the first connection before any response byte,
    // answers properly on the second
    let raw = TcpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        raw.on_connect(move |conn| {
            let n = accepted.get() + 1;
            accepted.set(n);
            if n == 1 {
                conn.close();
            } else {
                conn.write(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                );
            }
        });
    }
    let port = raw.local_addr().expect("addr").port();

    let client = HttpClient::new(&lp);
    client.set_retry_delay(Duration::from_millis(30));

    let ex = client.exchange();
    let log = watch(&ex, &lp);
    ex.request_start("GET", &format!("http://127.0.0.1:{}/", port), &Headers::new());
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert!(log.errors.is_empty(), "unexpected errors: {:?}", log.errors);
    assert_eq!(log.starts, vec![(200, "OK".to_string())]);
    assert_eq!(log.body, b"ok");
    assert_eq!(accepted.get(), 2);
    assert_eq!(ex.attempts(), 1);
}

#[test]
fn non_idempotent_request_is_not_retried() {
    let lp = test_loop();

    let raw = TcpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        raw.on_connect(move |conn| {
            accepted.set(accepted.get() + 1);
            conn.close();
        });
    }
    let port = raw.local_addr().expect("addr").port();

    let client = HttpClient::new(&lp);
    client.set_retry_delay(Duration::from_millis(30));

    let ex = client.exchange();
    let log = watch(&ex, &lp);
    ex.request_start("POST", &format!("http://127.0.0.1:{}/", port), &Headers::new());
    ex.request_body(b"payload");
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert_eq!(log.errors, vec!["socket-error"]);
    assert_eq!(log.done, 0);
    assert_eq!(accepted.get(), 1);
    assert_eq!(ex.attempts(), 0);
}

#[test]
fn read_timeout_retries_then_surfaces() {
    let lp = test_loop();

    // accepts and never answers
    let raw = TcpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    let accepted = Rc::new(Cell::new(0u32));
    {
        let accepted = accepted.clone();
        raw.on_connect(move |_conn| accepted.set(accepted.get() + 1));
    }
    let port = raw.local_addr().expect("addr").port();

    let client = HttpClient::new(&lp);
    client.set_read_timeout(Some(Duration::from_millis(80)));
    client.set_retry_delay(Duration::from_millis(30));

    let ex = client.exchange();
    let log = watch(&ex, &lp);
    ex.request_start("GET", &format!("http://127.0.0.1:{}/", port), &Headers::new());
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert_eq!(log.errors, vec!["read-timeout"]);
    assert_eq!(ex.attempts(), 2);
    assert_eq!(accepted.get(), 3);
}

#[test]
fn pooled_connection_ages_out() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");

    respond_with(&server, |ex| {
        ex.response_start(204, "No Content", &Headers::new());
        ex.response_done(&Headers::new());
    });

    let client = HttpClient::new(&lp);
    client.set_idle_timeout(Some(Duration::from_millis(100)));

    // the loop must keep running past the response so the idle timer can
    // fire; the eviction is what this test is for
    let ex = client.exchange();
    let idle_at_done = Rc::new(Cell::new(usize::MAX));
    {
        let client2 = client.clone();
        let idle_at_done = idle_at_done.clone();
        ex.on_response_done(move |_| idle_at_done.set(client2.idle_connections()));
    }

    ex.request_start("GET", &format!("{}/c", origin(&server)), &Headers::new());
    ex.request_done(&Headers::new());

    let idle_after = Rc::new(Cell::new(usize::MAX));
    {
        let client2 = client.clone();
        let idle_after = idle_after.clone();
        lp.schedule(Duration::from_millis(400), move |lp| {
            idle_after.set(client2.idle_connections());
            lp.stop();
        });
    }

    lp.run().expect("run");

    assert_eq!(idle_at_done.get(), 1, "connection parked at completion");
    assert_eq!(idle_after.get(), 0, "idle connection evicted after aging out");
}

#[test]
fn write_backpressure_pauses_and_resumes() {
    let lp = test_loop();

    let raw = TcpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    let server_conn: Rc<RefCell<Option<TcpConnection>>> = Rc::new(RefCell::new(None));
    let received = Rc::new(Cell::new(0usize));

    const TOTAL: usize = 1024 * 1024;

    {
        let server_conn = server_conn.clone();
        let received = received.clone();
        let lp2 = lp.clone();
        raw.on_connect(move |conn| {
            // deliberately not reading yet
            let received = received.clone();
            let lp3 = lp2.clone();
            conn.on_data(move |chunk| {
                received.set(received.get() + chunk.len());
                if received.get() >= TOTAL {
                    lp3.stop();
                }
            });
            *server_conn.borrow_mut() = Some(conn.clone());
        });
    }
    let port = raw.local_addr().expect("addr").port();

    let pauses: Rc<RefCell<Vec<bool>>> = Rc::new(RefCell::new(Vec::new()));
    let tcp = TcpClient::new(&lp);
    {
        let pauses = pauses.clone();
        tcp.on_connect(move |conn| {
            {
                let pauses = pauses.clone();
                conn.on_pause(move |flag| pauses.borrow_mut().push(*flag));
            }
            conn.write(&vec![7u8; TOTAL]);
        });
    }
    tcp.connect("127.0.0.1", port, Some(Duration::from_secs(2)));

    // let the peer start reading only after the writer has had time to
    // hit its high-water mark
    {
        let server_conn = server_conn.clone();
        lp.schedule(Duration::from_millis(100), move |_| {
            if let Some(conn) = server_conn.borrow().as_ref() {
                conn.pause(false);
            }
        });
    }

    lp.run().expect("run");

    assert_eq!(received.get(), TOTAL, "no data may be lost");
    let pauses = pauses.borrow();
    assert!(
        pauses.first() == Some(&true),
        "expected pause(true) first, got {:?}",
        pauses
    );
    assert!(
        pauses.contains(&false),
        "expected a pause(false) after draining, got {:?}",
        pauses
    );
}

#[test]
fn malformed_framing_gets_400_and_close() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    server.on_exchange(|_| panic!("malformed request must not surface an exchange"));
    let port = server.local_addr().expect("addr").port();

    let response: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let closed = Rc::new(Cell::new(false));

    let tcp = TcpClient::new(&lp);
    {
        let response = response.clone();
        let closed = closed.clone();
        let lp2 = lp.clone();
        tcp.on_connect(move |conn| {
            {
                let response = response.clone();
                conn.on_data(move |chunk| response.borrow_mut().extend_from_slice(chunk));
            }
            {
                let closed = closed.clone();
                let lp3 = lp2.clone();
                conn.on_close(move |_| {
                    closed.set(true);
                    lp3.stop();
                });
            }
            conn.pause(false);
            conn.write(
                b"GET / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\
                  Transfer-Encoding: chunked, gzip\r\n\r\n",
            );
        });
    }
    tcp.connect("127.0.0.1", port, Some(Duration::from_secs(2)));

    lp.run().expect("run");

    assert!(closed.get(), "server must close after the 400");
    let response = response.borrow();
    assert!(
        response.starts_with(b"HTTP/1.1 400"),
        "got {:?}",
        String::from_utf8_lossy(&response)
    );
}

#[test]
fn upstream_close_mid_response_is_fatal() {
    let lp = test_loop();

    let raw = TcpServer::listen(&lp, "127.0.0.1", 0).expect("listen");
    raw.on_connect(move |conn| {
        conn.write(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nfour");
        conn.close();
    });
    let port = raw.local_addr().expect("addr").port();

    let client = HttpClient::new(&lp);
    let ex = client.exchange();
    let log = watch(&ex, &lp);
    ex.request_start("GET", &format!("http://127.0.0.1:{}/", port), &Headers::new());
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    let log = log.borrow();
    assert_eq!(log.starts, vec![(200, "OK".to_string())]);
    assert_eq!(log.body, b"four");
    assert_eq!(log.done, 0, "a truncated response must not complete");
    assert_eq!(log.errors, vec!["upstream-close"]);
}

#[test]
fn connection_close_is_honored_instead_of_pooling() {
    let lp = test_loop();
    let server = HttpServer::listen(&lp, "127.0.0.1", 0).expect("listen");

    respond_with(&server, |ex| {
        let headers: Headers = [("Connection", "close")].into_iter().collect();
        ex.response_start(200, "OK", &headers);
        ex.response_body(b"bye");
        ex.response_done(&Headers::new());
    });

    let client = HttpClient::new(&lp);
    let ex = client.exchange();
    let log = watch(&ex, &lp);
    ex.request_start("GET", &format!("{}/d", origin(&server)), &Headers::new());
    ex.request_done(&Headers::new());

    lp.run().expect("run");

    assert_eq!(log.borrow().body, b"bye");
    assert_eq!(client.idle_connections(), 0);
}

use grpc::client::{Channel, ChannelOptions};
use grpc::service::{Request, Response, Service};
use grpc::{inmemory, server};
use tonic::async_trait;

struct Echo;

#[async_trait]
impl Service for Echo {
    async fn call(&self, mut request: Request) -> Response {
        println!("server got a call to {}", request.method());
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        while let Some(message) = request.next_message().await {
            let _ = tx.send(message).await;
        }
        Response::ok(rx)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    inmemory::register();

    let listener = inmemory::Listener::new();
    let target = listener.target();

    let mut srv = server::Server::new();
    srv.set_handler(Echo);
    tokio::spawn(async move {
        srv.serve(listener.as_ref()).await;
    });

    println!("dialing {target}");
    let channel = Channel::new(&target, ChannelOptions::default()).unwrap();
    let request = Request::unary("/demo.Echo/Call", bytes::Bytes::from_static(b"hello"));
    let mut response = channel.call(request).await;
    println!("call finished with status {:?}", response.status());
    while let Some(message) = response.next_message().await {
        println!("got message: {message:?}");
    }
}

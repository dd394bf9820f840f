mod rpc;

use std::net::SocketAddr;

use warp::Filter;

fn routes() -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path!("rpc"))
        .and(warp::body::json())
        .map(|request: rpc::RpcRequest| warp::reply::json(&rpc::handle(request)))
}

#[tokio::main]
async fn main() {
    let port = std::env::var("STUB_TOOLSERVER_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .unwrap_or(7010);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    println!("Stub tool server running at http://{}/rpc", addr);
    warp::serve(routes()).run(addr).await;
}

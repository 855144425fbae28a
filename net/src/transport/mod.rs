cfg_if! {
    if #[cfg(any(feature = "transport_tcp", feature = "transport_websocket"))] {
        mod task_bridge;
    }
}

cfg_if! {
    if #[cfg(feature = "transport_tcp")] {
        mod tcp;
        pub use tcp::TcpService;
    }
}

cfg_if! {
    if #[cfg(feature = "transport_websocket")] {
        mod websocket;
        pub use websocket::WebSocketService;
    }
}

cfg_if! {
    if #[cfg(feature = "transport_reliable")] {
        pub mod reliable;
        pub use reliable::ReliableService;
    }
}

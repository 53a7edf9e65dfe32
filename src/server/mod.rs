pub(crate) mod grpc_server;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    // Time before we stop retrying producing a message
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    /// Settings shared by every client of the cluster: brokers, statistics
    /// (which drive the liveness callback) and transport security.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "calculation-worker")]
    pub kafka_consumer_group: String,

    // Earliest so that a fresh group replays everything still retained upstream
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // Only observe records from committed producer transactions
    #[envconfig(default = "read_committed")]
    pub kafka_consumer_isolation_level: String, // read_committed, read_uncommitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn tls_is_opt_in() {
        let plain = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();
        let client_config = plain.client_config();
        assert_eq!(client_config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(client_config.get("security.protocol"), None);

        let env = HashMap::from([("KAFKA_TLS".to_string(), "true".to_string())]);
        let tls = KafkaConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(tls.client_config().get("security.protocol"), Some("ssl"));
    }
}

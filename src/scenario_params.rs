use spikeroute::params::SimParams;

pub const NUM_GROUPS: usize = 4;
pub const CELLS_PER_GROUP: usize = 250;
pub const CONNECTIONS_PER_CELL: usize = 25;
pub const NUM_STIMULUS_GIDS: usize = 100;

pub fn get_scenario_params() -> SimParams {
    let params_yaml_str = r#"
t_stop: 1000.0
exchange_interval: null
gid_space: 100000
num_replicas: 2
extracon: 5
threshold_teps: 0.0
compress_spikes: true
technical_params:
  num_threads: 1
  pin_threads: false
  exchange_timeout_ms: 10000
"#;

    SimParams::from_yaml(params_yaml_str).unwrap()
}

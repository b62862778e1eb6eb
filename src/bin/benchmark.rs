use std::time::Instant;

use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, seq::SliceRandom, SeedableRng};
use spikeroute::engine::{self, ThreadModel};
use spikeroute::mechanism::{Accumulator, PointProcess};
use spikeroute::phase1::{NetConRecord, Phase1, PreSynRecord, ThreadPopulation};
use spikeroute::transport::LocalTransport;
use spikeroute::types::Gid;
use statrs::distribution::Poisson;

#[path = "../scenario_params.rs"]
mod scenario_params;

use scenario_params::{CELLS_PER_GROUP, CONNECTIONS_PER_CELL, NUM_GROUPS, NUM_STIMULUS_GIDS};

const NUM_CELLS: usize = NUM_GROUPS * CELLS_PER_GROUP;

fn random_population(group: usize, rng: &mut StdRng) -> ThreadPopulation {
    let source_dist = Uniform::new(0, NUM_CELLS as Gid);
    let delay_dist = Uniform::new(1.0, 5.0);
    let stimulus_gids: Vec<Gid> = (0..NUM_STIMULUS_GIDS)
        .map(|idx| (NUM_CELLS + idx) as Gid)
        .collect();

    let mut population = ThreadPopulation {
        input_gids: stimulus_gids.clone(),
        ..ThreadPopulation::default()
    };

    for cell in 0..CELLS_PER_GROUP {
        population
            .output_gids
            .push((group * CELLS_PER_GROUP + cell) as Gid);
        population.presyns.push(PreSynRecord {
            threshold: 0.0,
            thvar: None,
            pntsrc: Some(cell),
        });

        for _ in 0..CONNECTIONS_PER_CELL {
            population.netcon_srcgids.push(source_dist.sample(rng));
            population.netcons.push(NetConRecord {
                target: Some(cell),
                delay: delay_dist.sample(rng),
                weights: vec![0.2],
                active: true,
            });
        }

        population
            .netcon_srcgids
            .push(*stimulus_gids.choose(rng).unwrap());
        population.netcons.push(NetConRecord {
            target: Some(cell),
            delay: 1.0,
            weights: vec![1.0],
            active: true,
        });
    }

    population
}

fn model(_thread: usize, _group: usize, _replica: usize) -> spikeroute::error::SimResult<ThreadModel> {
    let targets: Vec<Box<dyn PointProcess>> = (0..CELLS_PER_GROUP)
        .map(|cell| Box::new(Accumulator::firing(cell, 1.0)) as Box<dyn PointProcess>)
        .collect();

    Ok(ThreadModel {
        targets,
        state: vec![0.0; CELLS_PER_GROUP],
        watches: Vec::new(),
    })
}

fn main() {
    let params = scenario_params::get_scenario_params();
    let mut rng = StdRng::seed_from_u64(0);

    let groups: Vec<Phase1> = (0..NUM_GROUPS)
        .map(|group| Phase1::from_population(group, random_population(group, &mut rng)).unwrap())
        .collect();

    let mut simulation =
        engine::create_simulation(params, groups, model, Box::new(LocalTransport)).unwrap();

    let stimulus_gids: Vec<Gid> = (0..NUM_STIMULUS_GIDS)
        .map(|idx| (NUM_CELLS + idx) as Gid)
        .collect();
    let num_stimulus_spikes_dist = Poisson::new(5.0).unwrap();

    let wall_start = Instant::now();

    loop {
        let num_stimulus_spikes = num_stimulus_spikes_dist.sample(&mut rng) as usize;
        let t = simulation.t();
        for gid in stimulus_gids.choose_multiple(&mut rng, num_stimulus_spikes) {
            simulation.inject(*gid, t).unwrap();
        }

        if !simulation.run_interval().unwrap() {
            break;
        }
    }

    let wall_time = wall_start.elapsed();
    let raster = simulation.spike_raster().unwrap();
    let checksum: i64 = raster.spikes.iter().map(|spike| spike.gid as i64).sum();
    let throughput = simulation.netcon_deliveries() as f64 / wall_time.as_secs_f64();

    eprintln!(
        "Spikes per ms: {}",
        raster.len() as f64 / simulation.t_stop()
    );
    eprintln!(
        "Connection delivery throughput: {:.3e} ({:.3} ns per delivery)",
        throughput,
        1e9 / throughput
    );
    eprintln!("Checksum: {}", checksum);
}

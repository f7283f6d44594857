//! Default population reporters.
//!
//! Registers one series per primitive (`pop_<primitive>`), one per
//! configured breed (`pop_<primitive>_<breed>`), the total (`population`),
//! and a ten-period rolling mean of the total.

use tessera_core::Model;
use tessera_core::config::SimulationConfig;
use tessera_core::data::Derivation;

/// Window of the smoothed total population series.
pub const POPULATION_WINDOW: usize = 10;

/// Register the default reporters for every primitive in `config`.
pub fn register(model: &mut Model, config: &SimulationConfig) -> Result<(), tessera_core::ModelError> {
    model
        .data
        .add_reporter("population", |m| Ok(count_to_f64(m.agents().len())))?;
    model.data.add_series(
        "population_mean",
        "population",
        Derivation::RollingMean {
            window: POPULATION_WINDOW,
        },
    )?;

    for primitive in &config.primitives {
        let name = primitive.name.clone();
        model.data.add_reporter(&format!("pop_{name}"), move |m| {
            Ok(count_to_f64(m.agents().count(&name)))
        })?;

        for breed in &primitive.breeds {
            let prim = primitive.name.clone();
            let breed_name = breed.name.clone();
            model.data.add_reporter(
                &format!("pop_{}_{}", primitive.name, breed.name),
                move |m| Ok(count_to_f64(m.agents().count_breed(&prim, &breed_name))),
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
const fn count_to_f64(count: usize) -> f64 {
    count as f64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CONFIG: &str = r"
model:
  seed: 1
primitives:
  - name: agent
    count: 4
    breeds:
      - name: hawk
      - name: dove
";

    #[test]
    fn population_series_track_counts() {
        let config = SimulationConfig::parse(CONFIG).unwrap();
        let mut model = Model::from_config(&config).unwrap();
        register(&mut model, &config).unwrap();
        model.step().unwrap();

        assert_eq!(model.data.last("population"), Some(4.0));
        assert_eq!(model.data.last("pop_agent"), Some(4.0));
        assert_eq!(model.data.last("pop_agent_hawk"), Some(2.0));
        assert_eq!(model.data.last("population_mean"), Some(4.0));
    }
}
